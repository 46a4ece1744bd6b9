//! Visitor take workflow: claim a pending visitor for the current agent.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::api::VisitorApi;
use crate::error::ConsoleError;
use crate::models::{Visitor, resolve_display_name};
use crate::multiplexer::{ConsoleEvent, MultiplexerHandle};

#[derive(Debug, Clone, PartialEq)]
pub enum TakeOutcome {
    /// The claim went through; the visitor now carries its session.
    Taken(Visitor),
    /// Another claim for this visitor is running or just settled.
    AlreadyInFlight,
}

/// Claims visitors through REST and hands them to the multiplexer.
#[derive(Clone)]
pub struct TakeWorkflow {
    api: Arc<dyn VisitorApi>,
    mux: MultiplexerHandle,
    cooldown: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl TakeWorkflow {
    pub fn new(api: Arc<dyn VisitorApi>, mux: MultiplexerHandle, cooldown: Duration) -> Self {
        Self {
            api,
            mux,
            cooldown,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// True while a claim for this visitor is running or cooling down.
    pub fn is_blocked(&self, visitor_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(visitor_id))
            .unwrap_or(false)
    }

    fn try_acquire(&self, visitor_id: &str) -> Option<InFlightGuard> {
        let inserted = match self.in_flight.lock() {
            Ok(mut set) => set.insert(visitor_id.to_string()),
            Err(_) => false,
        };
        inserted.then(|| InFlightGuard {
            in_flight: self.in_flight.clone(),
            visitor_id: visitor_id.to_string(),
            cooldown: self.cooldown,
        })
    }

    fn claim_failed(&self, visitor_id: &str, message: String) {
        warn!(visitor = %visitor_id, "claim failed: {}", message);
        let _ = self.mux.event_sender().send(ConsoleEvent::ClaimFailed {
            visitor_id: visitor_id.to_string(),
            message,
        });
    }

    /// Claim `visitor` for the current agent and, if `open`, foreground it.
    ///
    /// On failure the visitor is left as it was and a
    /// [`ConsoleEvent::ClaimFailed`] is broadcast.
    pub async fn take(&self, visitor: &Visitor, open: bool) -> Result<TakeOutcome, ConsoleError> {
        let agent_id = self
            .mux
            .snapshot()
            .agent
            .map(|a| a.id)
            .ok_or(ConsoleError::NoAgent)?;

        let Some(guard) = self.try_acquire(&visitor.id) else {
            debug!(visitor = %visitor.id, "claim already in flight");
            return Ok(TakeOutcome::AlreadyInFlight);
        };

        let result = self
            .api
            .take_visitor(agent_id.clone(), visitor.id.clone())
            .await;
        drop(guard);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.claim_failed(&visitor.id, e.to_string());
                return Err(e);
            }
        };

        if !response.success {
            let message = response
                .message
                .unwrap_or_else(|| "visitor could not be claimed".to_string());
            self.claim_failed(&visitor.id, message.clone());
            return Err(ConsoleError::ClaimRejected {
                visitor_id: visitor.id.clone(),
                message,
            });
        }
        let Some(session_id) = response.session_id else {
            let message = "claim succeeded without a session id".to_string();
            self.claim_failed(&visitor.id, message.clone());
            return Err(ConsoleError::Protocol(message));
        };

        let mut taken = visitor.clone();
        taken.metadata.extend(response.metadata);
        taken.display_name = resolve_display_name(
            response.first_name.as_deref(),
            response.last_name.as_deref(),
            &taken.metadata,
        )
        .or(taken.display_name);
        taken.agent_id = Some(agent_id);
        taken.session_id = Some(session_id);
        taken.past_count = response.visitor_past_count;
        taken.chat_count = response.visitor_chat_count;
        taken.last_seen = Utc::now();

        info!(
            visitor = %taken.id,
            session = ?taken.session_id,
            "visitor taken"
        );
        let _ = self
            .mux
            .event_sender()
            .send(ConsoleEvent::VisitorActivated(taken.clone()));
        if open {
            self.mux.open_chat(taken.clone()).await?;
        }
        Ok(TakeOutcome::Taken(taken))
    }
}

/// Holds a visitor in the in-flight set. Dropping it, including when the
/// `take` future is cancelled mid-request, starts the cooldown.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    visitor_id: String,
    cooldown: Duration,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let in_flight = self.in_flight.clone();
        let visitor_id = std::mem::take(&mut self.visitor_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cooldown = self.cooldown;
                handle.spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    if let Ok(mut set) = in_flight.lock() {
                        set.remove(&visitor_id);
                    }
                });
            }
            // No runtime left to wait on
            Err(_) => {
                if let Ok(mut set) = in_flight.lock() {
                    set.remove(&visitor_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsoleConfig;
    use crate::models::Agent;
    use crate::protocol::TakeVisitorResponse;
    use crate::test_helpers::{FakeApi, FakeConnector, next_peer};
    use tokio::sync::oneshot;

    fn success(session_id: &str) -> TakeVisitorResponse {
        TakeVisitorResponse {
            success: true,
            session_id: Some(session_id.into()),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            visitor_past_count: 3,
            visitor_chat_count: 1,
            ..Default::default()
        }
    }

    async fn setup(
        cooldown: Duration,
    ) -> (
        TakeWorkflow,
        MultiplexerHandle,
        Arc<FakeApi>,
        tokio::sync::mpsc::UnboundedReceiver<crate::test_helpers::FakePeer>,
    ) {
        let (connector, peers) = FakeConnector::new();
        let api = Arc::new(FakeApi::default());
        let config = ConsoleConfig {
            ws_base: "ws://srv".into(),
            ..ConsoleConfig::default()
        };
        let mux = MultiplexerHandle::spawn(config, connector, api.clone());
        mux.set_agent(Agent::new("A1")).await.unwrap();
        mux.flush().await.unwrap();
        let workflow = TakeWorkflow::new(api.clone(), mux.clone(), cooldown);
        (workflow, mux, api, peers)
    }

    #[tokio::test]
    async fn successful_take_opens_chat() {
        let (workflow, mux, api, mut peers) = setup(Duration::from_millis(50)).await;
        api.take_responses
            .lock()
            .unwrap()
            .insert("v1".into(), success("S1"));
        let mut events = mux.subscribe_events();

        let outcome = workflow.take(&Visitor::new("v1"), true).await.unwrap();
        let TakeOutcome::Taken(taken) = outcome else {
            panic!("expected a claim");
        };
        assert_eq!(taken.agent_id.as_deref(), Some("A1"));
        assert_eq!(taken.session_id.as_deref(), Some("S1"));
        assert_eq!(taken.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(taken.past_count, 3);

        assert_eq!(
            events.recv().await.unwrap(),
            ConsoleEvent::VisitorActivated(taken.clone())
        );
        let peer = next_peer(&mut peers).await;
        assert_eq!(peer.url, "ws://srv/ws/chat/S1/A1");
        mux.flush().await.unwrap();
        assert_eq!(mux.snapshot().foreground_id(), Some("v1"));
    }

    #[tokio::test]
    async fn take_without_open_leaves_multiplexer_alone() {
        let (workflow, mux, api, _peers) = setup(Duration::from_millis(50)).await;
        api.take_responses
            .lock()
            .unwrap()
            .insert("v1".into(), success("S1"));

        let outcome = workflow.take(&Visitor::new("v1"), false).await.unwrap();
        assert!(matches!(outcome, TakeOutcome::Taken(_)));
        mux.flush().await.unwrap();
        assert!(mux.snapshot().foreground.is_none());
    }

    #[tokio::test]
    async fn rejected_claim_reports_and_leaves_visitor_unchanged() {
        let (workflow, mux, api, _peers) = setup(Duration::from_millis(50)).await;
        api.take_responses.lock().unwrap().insert(
            "v1".into(),
            TakeVisitorResponse {
                success: false,
                message: Some("already taken".into()),
                ..Default::default()
            },
        );
        let mut events = mux.subscribe_events();

        let visitor = Visitor::new("v1");
        let err = workflow.take(&visitor, true).await.unwrap_err();
        assert!(matches!(
            err,
            ConsoleError::ClaimRejected { ref message, .. } if message == "already taken"
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ConsoleEvent::ClaimFailed { .. }
        ));
        assert!(!visitor.is_assigned());
        mux.flush().await.unwrap();
        assert!(mux.snapshot().sessions.is_empty());
    }

    #[tokio::test]
    async fn double_click_collapses_to_one_request() {
        let (workflow, _mux, api, _peers) = setup(Duration::from_millis(100)).await;
        api.take_responses
            .lock()
            .unwrap()
            .insert("v1".into(), success("S1"));
        let (release, gate) = oneshot::channel();
        *api.take_gate.lock().unwrap() = Some(gate);

        let first = {
            let workflow = workflow.clone();
            tokio::spawn(async move { workflow.take(&Visitor::new("v1"), false).await })
        };
        for _ in 0..100 {
            if !api.take_calls.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = workflow.take(&Visitor::new("v1"), false).await.unwrap();
        assert_eq!(second, TakeOutcome::AlreadyInFlight);

        release.send(()).unwrap();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, TakeOutcome::Taken(_)));

        // Still cooling down
        assert!(workflow.is_blocked("v1"));
        let third = workflow.take(&Visitor::new("v1"), false).await.unwrap();
        assert_eq!(third, TakeOutcome::AlreadyInFlight);
        assert_eq!(api.take_calls.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!workflow.is_blocked("v1"));
        workflow.take(&Visitor::new("v1"), false).await.unwrap();
        assert_eq!(api.take_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_take_releases_after_cooldown() {
        let (workflow, _mux, api, _peers) = setup(Duration::from_millis(20)).await;
        api.take_responses
            .lock()
            .unwrap()
            .insert("v1".into(), success("S1"));
        let (_release, gate) = oneshot::channel::<()>();
        *api.take_gate.lock().unwrap() = Some(gate);

        let timed_out = tokio::time::timeout(
            Duration::from_millis(50),
            workflow.take(&Visitor::new("v1"), false),
        )
        .await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!workflow.is_blocked("v1"));
        let retry = workflow.take(&Visitor::new("v1"), false).await.unwrap();
        assert!(matches!(retry, TakeOutcome::Taken(_)));
        assert_eq!(api.take_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn take_requires_agent() {
        let (connector, _peers) = FakeConnector::new();
        let api = Arc::new(FakeApi::default());
        let mux = MultiplexerHandle::spawn(ConsoleConfig::default(), connector, api.clone());
        let workflow = TakeWorkflow::new(api.clone(), mux, Duration::from_millis(10));

        let err = workflow.take(&Visitor::new("v1"), true).await.unwrap_err();
        assert!(matches!(err, ConsoleError::NoAgent));
        assert!(api.take_calls.lock().unwrap().is_empty());
    }
}
