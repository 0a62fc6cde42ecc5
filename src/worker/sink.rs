//! Where responses go once the gateway has produced them.

use transcode_worker_types::Response;

/// Outbound side of the worker. Posting moves the response, and with it any
/// output buffer, to the receiver.
pub trait ResponseSink: Send + Sync {
    fn post(&self, response: Response);
}

impl ResponseSink for crossbeam_channel::Sender<Response> {
    fn post(&self, response: Response) {
        if self.send(response).is_err() {
            log::debug!("[GATEWAY] Response receiver gone, dropping response");
        }
    }
}

impl ResponseSink for tokio::sync::mpsc::UnboundedSender<Response> {
    fn post(&self, response: Response) {
        if self.send(response).is_err() {
            log::debug!("[GATEWAY] Response receiver gone, dropping response");
        }
    }
}
