//! Request dispatch against the scheduler.

use crate::error::ControlError;
use crate::network::messages::{ErrorMessage, Request, Response};
use crate::network::session::ClientSession;
use crate::scheduler::Scheduler;
use std::sync::Arc;

/// Turns client requests into scheduler calls and scheduler outcomes into
/// replies. Every request gets exactly one reply.
#[derive(Clone, Debug)]
pub struct Gateway {
    scheduler: Scheduler,
}

impl Gateway {
    /// Dispatcher over `scheduler`.
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// The scheduler requests are dispatched to.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Decode one JSON line and handle it.
    pub async fn handle_line(&self, line: &str, session: &Arc<ClientSession>) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request, session).await,
            Err(e) => {
                tracing::debug!(error = %e, "rejected request line");
                let error = ControlError::Validation(format!("malformed request: {e}"));
                ErrorMessage::from_error(&error, None).into()
            }
        }
    }

    /// Handle one request; every request gets exactly one reply.
    pub async fn handle(&self, request: Request, session: &Arc<ClientSession>) -> Response {
        session.touch();
        match request {
            Request::Submit(submit) => match self.scheduler.submit(submit, Some(session)).await {
                Ok(ack) => ack.into(),
                Err(e) => ErrorMessage::from_error(&e, None).into(),
            },
            Request::Status(target) => match self.scheduler.status(&target.task_id).await {
                Ok(status) => status.into(),
                Err(e) => ErrorMessage::from_error(&e, Some(target.task_id)).into(),
            },
            Request::Result(target) => match self.scheduler.result(&target.task_id).await {
                Ok(result) => result.into(),
                Err(e) => ErrorMessage::from_error(&e, Some(target.task_id)).into(),
            },
            Request::Cancel(target) => match self.scheduler.cancel(&target.task_id).await {
                Ok(status) => status.into(),
                Err(e) => ErrorMessage::from_error(&e, Some(target.task_id)).into(),
            },
            Request::Ping => Response::Pong,
        }
    }
}
