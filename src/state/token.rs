//! Single-shot wait token.
//!
//! A token is handed to the caller when a sent message expects a terminal
//! response. The protocol thread settles it exactly once; every waiter is
//! woken and every later `complete`/`fail` is a no-op.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::Frame;
use crate::state::StateError;

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Pending,
    Complete,
    Error(StateError),
}

#[derive(Debug)]
struct TokenState {
    request: Frame,
    response: Option<Frame>,
    outcome: Outcome,
}

/// Cheaply cloneable handle; all clones observe the same settlement.
#[derive(Debug, Clone)]
pub struct WaitToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    state: Mutex<TokenState>,
    notify: Notify,
}

impl WaitToken {
    pub fn new(request: Frame) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState {
                    request,
                    response: None,
                    outcome: Outcome::Pending,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// The message this token was issued for.
    pub fn request(&self) -> Frame {
        self.inner.state.lock().request.clone()
    }

    /// The terminal response, once settled.
    pub fn response(&self) -> Option<Frame> {
        self.inner.state.lock().response.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().outcome == Outcome::Complete
    }

    pub fn is_error(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Outcome::Error(_))
    }

    #[allow(dead_code)]
    pub(crate) fn is_settled(&self) -> bool {
        self.inner.state.lock().outcome != Outcome::Pending
    }

    /// Settle successfully. No-op once settled.
    pub fn complete(&self, response: Option<Frame>) {
        {
            let mut state = self.inner.state.lock();
            if state.outcome != Outcome::Pending {
                return;
            }
            state.response = response;
            state.outcome = Outcome::Complete;
        }
        self.inner.notify.notify_waiters();
    }

    /// Settle with an error. No-op once settled.
    pub fn fail(&self, error: StateError) {
        self.fail_with_response(None, error);
    }

    /// Settle with an error while recording the offending response frame
    /// (e.g. an unexpected DISCONNECT).
    pub(crate) fn fail_with_response(&self, response: Option<Frame>, error: StateError) {
        {
            let mut state = self.inner.state.lock();
            if state.outcome != Outcome::Pending {
                return;
            }
            state.response = response;
            state.outcome = Outcome::Error(error);
        }
        self.inner.notify.notify_waiters();
    }

    /// Block until settled or until `timeout` elapses. Spurious wakeups are
    /// absorbed by re-checking the state cell against the deadline.
    pub async fn wait(&self, timeout: Duration) -> Result<Option<Frame>, StateError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before inspecting state so a settlement
            // between the check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            {
                let state = self.inner.state.lock();
                match &state.outcome {
                    Outcome::Complete => return Ok(state.response.clone()),
                    Outcome::Error(err) => return Err(err.clone()),
                    Outcome::Pending => {}
                }
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    let state = self.inner.state.lock();
                    return match &state.outcome {
                        Outcome::Complete => Ok(state.response.clone()),
                        Outcome::Error(err) => Err(err.clone()),
                        Outcome::Pending => Err(StateError::Timeout),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReturnCode;

    fn pingreq() -> Frame {
        Frame::Pingreq { client_id: None }
    }

    #[tokio::test]
    async fn settles_once_and_wakes_waiters() {
        let token = WaitToken::new(pingreq());
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        token.complete(Some(Frame::Pingresp));
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got, Some(Frame::Pingresp));
        assert!(token.is_complete());
        assert!(!token.is_error());
    }

    #[tokio::test]
    async fn fail_after_complete_is_a_no_op() {
        let token = WaitToken::new(pingreq());
        token.complete(Some(Frame::Pingresp));
        token.fail(StateError::Timeout);
        assert!(token.is_complete());
        assert_eq!(
            token.wait(Duration::from_millis(1)).await.unwrap(),
            Some(Frame::Pingresp)
        );
    }

    #[tokio::test]
    async fn complete_after_fail_is_a_no_op() {
        let token = WaitToken::new(pingreq());
        token.fail(StateError::Protocol(ReturnCode::RejectedCongested));
        token.complete(Some(Frame::Pingresp));
        assert!(token.is_error());
        assert_eq!(
            token.wait(Duration::from_millis(1)).await,
            Err(StateError::Protocol(ReturnCode::RejectedCongested))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_on_a_pending_token() {
        let token = WaitToken::new(pingreq());
        let res = token.wait(Duration::from_millis(50)).await;
        assert_eq!(res, Err(StateError::Timeout));
        // The token itself is untouched by a waiter timing out.
        assert!(!token.is_settled());
    }

    #[tokio::test]
    async fn wait_after_settlement_returns_immediately() {
        let token = WaitToken::new(pingreq());
        token.complete(None);
        assert_eq!(token.wait(Duration::ZERO).await.unwrap(), None);
    }
}
