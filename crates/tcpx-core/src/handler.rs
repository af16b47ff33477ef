//! Application event handler.

/// Completion callbacks for one transport.
///
/// All callbacks run on the transport's poller thread and must not block;
/// move real work to a worker pool. The byte view handed to
/// [`EventHandler::on_data_received`] is valid only for the duration of the
/// call; the buffer behind it is recycled as soon as the callback returns.
///
/// A panic inside a callback is caught and logged; it never terminates the
/// poller.
pub trait EventHandler: Send {
    fn on_connected(&mut self, token: u64) {
        let _ = token;
    }

    fn on_connection_failed(&mut self, token: u64, cause: &str) {
        let _ = (token, cause);
    }

    fn on_data_received(&mut self, data: &[u8]);

    fn on_send_complete(&mut self, token: u64) {
        let _ = token;
    }

    fn on_send_failed(&mut self, token: u64, cause: &str) {
        let _ = (token, cause);
    }

    fn on_closed(&mut self) {}
}
