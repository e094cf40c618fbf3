//! Hook registration and dispatch.

use crate::errors::Result;
use crate::flow::{Flow, HookFailure};
use std::fmt;
use std::sync::Arc;

/// Lifecycle points at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
  /// the request was parsed; nothing has been sent to the origin yet
  Request,
  /// the response was parsed; nothing has been sent to the client yet
  Response,
  /// the flow failed; `Flow::error` says why
  Error,
}

impl fmt::Display for Event {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Event::Request => "request",
      Event::Response => "response",
      Event::Error => "error",
    })
  }
}

/// What a hook asks the pipeline to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
  /// keep going
  #[default]
  Continue,
  /// stop dispatching, forward nothing more for this flow and close the connection
  Drop,
  /// finish this exchange, then close the connection
  CloseConnection,
}

/// Logic attached to flow lifecycle events.
///
/// Returning an error does not stop the flow: the failure is recorded on the
/// flow and the remaining hooks still run.
#[async_trait::async_trait]
pub trait Hook: Send + Sync {
  /// Observe or edit `flow` at `event`.
  async fn handle(&self, event: Event, flow: &mut Flow) -> Result<Control>;
}

/// Adapts a synchronous closure into a [`Hook`].
pub struct FnHook<F>(pub F);

#[async_trait::async_trait]
impl<F> Hook for FnHook<F>
where
  F: Fn(Event, &mut Flow) -> Result<Control> + Send + Sync,
{
  async fn handle(&self, event: Event, flow: &mut Flow) -> Result<Control> {
    (self.0)(event, flow)
  }
}

struct Registration {
  event: Event,
  name: String,
  hook: Arc<dyn Hook>,
}

/// Ordered dispatch table of hooks keyed by event.
#[derive(Default)]
pub struct HookRegistry {
  registrations: Vec<Registration>,
}

impl fmt::Debug for HookRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list()
      .entries(
        self
          .registrations
          .iter()
          .map(|r| format!("{}:{}", r.event, r.name)),
      )
      .finish()
  }
}

impl HookRegistry {
  /// An empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Subscribe `hook` to `event`. Hooks run in registration order.
  pub fn register(&mut self, event: Event, name: impl Into<String>, hook: Arc<dyn Hook>) {
    self.registrations.push(Registration {
      event,
      name: name.into(),
      hook,
    });
  }

  /// Subscribe a synchronous closure to `event`.
  pub fn register_fn<F>(&mut self, event: Event, name: impl Into<String>, f: F)
  where
    F: Fn(Event, &mut Flow) -> Result<Control> + Send + Sync + 'static,
  {
    self.register(event, name, Arc::new(FnHook(f)));
  }

  /// Number of hooks subscribed to `event`.
  pub fn count(&self, event: Event) -> usize {
    self
      .registrations
      .iter()
      .filter(|r| r.event == event)
      .count()
  }

  /// Run every hook subscribed to `event` against `flow`, in order.
  ///
  /// `Drop` stops dispatch at once. `CloseConnection` is remembered and the
  /// remaining hooks still run. Response hooks are skipped while the flow has
  /// no response, including once an earlier hook has cleared it.
  pub async fn dispatch(&self, event: Event, flow: &mut Flow) -> Control {
    let mut outcome = Control::Continue;
    for registration in self.registrations.iter().filter(|r| r.event == event) {
      if event == Event::Response && flow.response.is_none() {
        tracing::debug!(
          flow = %flow.id(),
          hook = %registration.name,
          "response cleared, skipping remaining response hooks"
        );
        break;
      }
      match registration.hook.handle(event, flow).await {
        Ok(Control::Continue) => {}
        Ok(Control::CloseConnection) => outcome = Control::CloseConnection,
        Ok(Control::Drop) => {
          tracing::debug!(flow = %flow.id(), hook = %registration.name, "hook dropped flow");
          return Control::Drop;
        }
        Err(e) => {
          tracing::warn!(
            flow = %flow.id(),
            hook = %registration.name,
            %event,
            "hook failed: {}",
            e
          );
          flow.record_hook_failure(HookFailure {
            hook: registration.name.clone(),
            event,
            message: e.to_string(),
          });
        }
      }
    }
    outcome
  }
}
