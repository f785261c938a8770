//! Target resolution: rule matching, on-demand starts, and target rewriting.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout_at};

use super::{
    Broker,
    error::{BrokerError, BrokerResult},
};
use crate::state::{EmulatorState, Readiness};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveOutcome {
    pub target: String,
    pub requires_secure_connection: bool,
}

/// What has to happen before the matched rule's host can be read.
enum Gate {
    Ready,
    StartOnDemand(String),
    Join(String, Arc<Readiness>),
}

impl Broker {
    /// Resolve a client-supplied target against the rule table.
    ///
    /// A target matching no rule is echoed back unchanged. A match against a
    /// rule owned by an OFFLINE on-demand emulator starts it within this
    /// call's deadline; a match against a STARTING emulator joins the
    /// in-flight start. Either path surfaces `Unavailable` on failure.
    pub async fn resolve(
        self: &Arc<Self>,
        target: &str,
        caller_deadline: Option<Instant>,
    ) -> BrokerResult<ResolveOutcome> {
        let (rule_id, gate) = {
            let inner = self.inner.lock();
            let mut matches = inner.rules.values().filter(|rule| rule.matches(target));
            let Some(rule) = matches.next() else {
                return Ok(ResolveOutcome {
                    target: target.to_string(),
                    requires_secure_connection: false,
                });
            };
            if matches.next().is_some() {
                tracing::warn!(
                    rule = %rule.rule_id,
                    "multiple rules match {target:?}; using the first by rule id"
                );
            }
            let rule_id = rule.rule_id.clone();

            let owner = inner
                .emulators
                .values()
                .find(|record| record.rule_id == rule_id);
            let gate = match owner {
                None => Gate::Ready,
                Some(record) => match record.state {
                    EmulatorState::Online => Gate::Ready,
                    EmulatorState::Starting => Gate::Join(
                        record.emulator_id.clone(),
                        record
                            .readiness
                            .clone()
                            .expect("a STARTING record always carries a readiness signal"),
                    ),
                    EmulatorState::Offline if record.start_on_demand => {
                        Gate::StartOnDemand(record.emulator_id.clone())
                    }
                    EmulatorState::Offline => Gate::Ready,
                },
            };
            (rule_id, gate)
        };

        match gate {
            Gate::Ready => {}
            Gate::StartOnDemand(emulator_id) => {
                tracing::info!(emulator = %emulator_id, "starting emulator on demand for {target:?}");
                match self.start_emulator(&emulator_id, caller_deadline).await {
                    Ok(()) => {}
                    // A concurrent caller raced us to the start and won.
                    Err(BrokerError::AlreadyExists(_)) => {}
                    Err(error) => {
                        return Err(BrokerError::Unavailable(format!(
                            "emulator {emulator_id:?} could not be started: {error}"
                        )));
                    }
                }
            }
            Gate::Join(emulator_id, readiness) => {
                let deadline = self.effective_deadline(caller_deadline);
                let outcome = match deadline {
                    Some(deadline) => timeout_at(deadline, readiness.wait())
                        .await
                        .unwrap_or_else(|_| {
                            Err(BrokerError::DeadlineExceeded(format!(
                                "emulator {emulator_id:?} was still starting at the resolve deadline"
                            )))
                        }),
                    None => readiness.wait().await,
                };
                outcome.map_err(|error| {
                    BrokerError::Unavailable(format!(
                        "emulator {emulator_id:?} did not come online: {error}"
                    ))
                })?;
            }
        }

        let (resolved_host, requires_secure_connection) = {
            let inner = self.inner.lock();
            let rule = inner.rules.get(&rule_id).ok_or_else(|| {
                BrokerError::Unavailable(format!("rule {rule_id:?} vanished during resolution"))
            })?;
            (rule.resolved_host.clone(), rule.requires_secure_connection)
        };
        if resolved_host.is_empty() {
            return Err(BrokerError::Unavailable(format!(
                "rule {rule_id:?} matched {target:?} but has no resolved host"
            )));
        }

        Ok(ResolveOutcome {
            target: rewrite_target(target, &resolved_host, requires_secure_connection),
            requires_secure_connection,
        })
    }
}

/// Rewrite a matched target onto the rule's resolved host.
///
/// URL inputs keep their path and query while the scheme is forced by the
/// secure-connection flag, regardless of the input scheme. Host, host:port
/// and RPC method path inputs all collapse to the resolved host itself.
fn rewrite_target(target: &str, resolved_host: &str, requires_secure: bool) -> String {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"));
    match rest {
        Some(rest) => {
            let tail = rest
                .find(['/', '?'])
                .map(|index| &rest[index..])
                .unwrap_or("");
            let scheme = if requires_secure { "https" } else { "http" };
            format!("{scheme}://{resolved_host}{tail}")
        }
        None => resolved_host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::{sleeper_spec, test_broker, wait_for_state};
    use crate::broker::{RuleSpec, error::BrokerError};
    use std::time::Duration;

    fn outcome(target: &str, secure: bool) -> ResolveOutcome {
        ResolveOutcome {
            target: target.to_string(),
            requires_secure_connection: secure,
        }
    }

    async fn resolve_with_rule(
        secure: bool,
        target: &str,
    ) -> BrokerResult<ResolveOutcome> {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_resolve_rule(RuleSpec {
                rule_id: "r".to_string(),
                target_patterns: vec!["foo".to_string()],
                resolved_host: "bar".to_string(),
                requires_secure_connection: secure,
            })
            .expect("create rule");
        broker.resolve(target, None).await
    }

    #[tokio::test]
    async fn rewrites_host_and_url_targets() {
        assert_eq!(
            resolve_with_rule(false, "foo").await.expect("resolve"),
            outcome("bar", false)
        );
        assert_eq!(
            resolve_with_rule(true, "foo").await.expect("resolve"),
            outcome("bar", true)
        );
        assert_eq!(
            resolve_with_rule(false, "http://foo/baz")
                .await
                .expect("resolve"),
            outcome("http://bar/baz", false)
        );
        assert_eq!(
            resolve_with_rule(false, "https://foo/baz")
                .await
                .expect("resolve"),
            outcome("http://bar/baz", false)
        );
        assert_eq!(
            resolve_with_rule(true, "http://foo/baz")
                .await
                .expect("resolve"),
            outcome("https://bar/baz", true)
        );
        assert_eq!(
            resolve_with_rule(true, "https://foo/baz")
                .await
                .expect("resolve"),
            outcome("https://bar/baz", true)
        );
    }

    #[tokio::test]
    async fn url_rewrites_keep_query_strings() {
        assert_eq!(
            resolve_with_rule(false, "http://foo?q=1")
                .await
                .expect("resolve"),
            outcome("http://bar?q=1", false)
        );
        assert_eq!(
            resolve_with_rule(false, "http://foo/baz?q=1&r=2")
                .await
                .expect("resolve"),
            outcome("http://bar/baz?q=1&r=2", false)
        );
    }

    #[tokio::test]
    async fn method_path_targets_resolve_to_the_host() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_resolve_rule(RuleSpec {
                rule_id: "r".to_string(),
                target_patterns: vec!["/my\\.Service/.*".to_string()],
                resolved_host: "localhost:4000".to_string(),
                requires_secure_connection: false,
            })
            .expect("create rule");
        assert_eq!(
            broker
                .resolve("/my.Service/Method", None)
                .await
                .expect("resolve"),
            outcome("localhost:4000", false)
        );
    }

    #[tokio::test]
    async fn unmatched_targets_echo_back_unchanged() {
        let broker = test_broker(Vec::new(), None);
        let outcome = broker.resolve("foo", None).await.expect("resolve");
        assert_eq!(outcome.target, "foo");
        assert!(!outcome.requires_secure_connection);
    }

    #[tokio::test]
    async fn matched_rule_without_host_is_unavailable() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_emulator(sleeper_spec("dummy", false))
            .expect("create");
        let err = broker.resolve("dummy_service", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn resolve_starts_an_offline_on_demand_emulator() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_emulator(sleeper_spec("real", true))
            .expect("create");

        let resolver = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.resolve("real_service", None).await })
        };
        wait_for_state(&broker, "real", crate::state::EmulatorState::Starting).await;
        broker
            .report_emulator_online("real", "localhost:20000".to_string(), Vec::new())
            .expect("report online");

        let outcome = resolver.await.expect("join").expect("resolve succeeds");
        assert_eq!(outcome.target, "localhost:20000");
        assert_eq!(
            broker.get_emulator("real").expect("get").state,
            crate::state::EmulatorState::Online
        );
        broker.stop_emulator("real").await.expect("stop");
    }

    #[tokio::test]
    async fn resolve_joins_an_in_flight_start() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_emulator(sleeper_spec("real", true))
            .expect("create");

        let starter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.start_emulator("real", None).await })
        };
        wait_for_state(&broker, "real", crate::state::EmulatorState::Starting).await;

        let resolver = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.resolve("real_service", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!resolver.is_finished());

        broker
            .report_emulator_online("real", "localhost:20001".to_string(), Vec::new())
            .expect("report online");
        starter.await.expect("join").expect("start succeeds");
        let outcome = resolver.await.expect("join").expect("resolve succeeds");
        assert_eq!(outcome.target, "localhost:20001");
        broker.stop_emulator("real").await.expect("stop");
    }

    #[tokio::test]
    async fn resolve_deadline_during_start_is_unavailable() {
        let broker = test_broker(Vec::new(), Some(Duration::from_millis(300)));
        broker
            .create_emulator(sleeper_spec("slow", true))
            .expect("create");

        let err = broker.resolve("slow_service", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert_eq!(
            broker.get_emulator("slow").expect("get").state,
            crate::state::EmulatorState::Offline
        );
    }

    #[tokio::test]
    async fn offline_without_on_demand_is_not_started() {
        let broker = test_broker(Vec::new(), None);
        broker
            .create_emulator(sleeper_spec("dummy", false))
            .expect("create");
        let err = broker.resolve("dummy_service", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert_eq!(
            broker.get_emulator("dummy").expect("get").state,
            crate::state::EmulatorState::Offline
        );
    }
}
