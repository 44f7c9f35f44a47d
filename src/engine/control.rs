//! Interactive interrupt/stop requests, delivered from the input layer to
//! whichever supervision loop is running in the session.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Interrupt,
    Stop,
}

#[derive(Debug, Clone, Copy, Default)]
struct ControlState {
    seq: u64,
    last: Option<ControlRequest>,
}

/// Sending side. Cheap to clone; every clone feeds the same session.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: watch::Sender<ControlState>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::default());
        Self { tx }
    }

    pub fn request(&self, request: ControlRequest) {
        self.tx.send_modify(|state| {
            state.seq += 1;
            state.last = Some(request);
        });
    }

    pub fn interrupt(&self) {
        self.request(ControlRequest::Interrupt);
    }

    pub fn stop(&self) {
        self.request(ControlRequest::Stop);
    }

    /// Listener that only sees requests made after this call. Requests that
    /// arrived while nothing was running are dropped.
    pub fn listen(&self) -> ControlListener {
        ControlListener {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug)]
pub struct ControlListener {
    rx: watch::Receiver<ControlState>,
}

impl ControlListener {
    /// Resolves on the next request. Cancel-safe, so it can sit in a `select!`.
    pub async fn next(&mut self) -> ControlRequest {
        loop {
            if self.rx.changed().await.is_err() {
                // The handle is gone, nothing can ever arrive.
                std::future::pending::<()>().await;
            }
            if let Some(request) = self.rx.borrow_and_update().last {
                return request;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn listener_ignores_requests_made_before_it_existed() {
        let handle = ControlHandle::new();
        handle.interrupt();
        let mut listener = handle.listen();
        let early = tokio::time::timeout(Duration::from_millis(50), listener.next()).await;
        assert!(early.is_err());

        handle.stop();
        assert_eq!(listener.next().await, ControlRequest::Stop);
    }

    #[tokio::test]
    async fn repeated_requests_are_each_observed() {
        let handle = ControlHandle::new();
        let mut listener = handle.listen();
        handle.interrupt();
        assert_eq!(listener.next().await, ControlRequest::Interrupt);
        handle.interrupt();
        assert_eq!(listener.next().await, ControlRequest::Interrupt);
    }
}
