use std::future::Future;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::TelemetryConfig;
use crate::node::NodeMetadata;

/// Collaborator fetching bootstrap material from the control plane.
///
/// Each method is one network round-trip; the state machine drives them
/// in order and never nests continuations.
pub trait ConfigFetcher: Send {
    /// Fetches local node metadata from the platform metadata service.
    fn fetch_metadata(&mut self) -> impl Future<Output = Result<NodeMetadata>> + Send;

    /// Fetches a service access token.
    fn fetch_token(&mut self) -> impl Future<Output = Result<String>> + Send;

    /// Lists rollout ids, newest first.
    fn fetch_rollouts(&mut self, token: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Fetches the telemetry configuration of one rollout.
    fn fetch_config(
        &mut self,
        token: &str,
        rollout: &str,
    ) -> impl Future<Output = Result<TelemetryConfig>> + Send;
}

/// Bootstrap progress. Each state names the fetch in flight; `Failed`
/// is terminal and records where the sequence halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    FetchingMetadata,
    FetchingToken,
    FetchingRollouts,
    FetchingConfigs,
    Applied,
    Failed,
}

impl BootstrapState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FetchingMetadata => "fetching_metadata",
            Self::FetchingToken => "fetching_token",
            Self::FetchingRollouts => "fetching_rollouts",
            Self::FetchingConfigs => "fetching_configs",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

/// Result of a completed bootstrap: the applied configuration bundle.
#[derive(Debug, Clone)]
pub struct AppliedBundle {
    pub node: NodeMetadata,
    pub config: TelemetryConfig,
    pub rollout: String,
}

/// Explicit bootstrap state machine.
///
/// `FetchingMetadata -> FetchingToken -> FetchingRollouts ->
/// FetchingConfigs -> Applied`, advanced one transition per
/// [`Bootstrap::step`]. A failed transition logs and halts the machine
/// in `Failed`, recording the state it failed in; nothing is retried
/// here, the caller decides whether to rerun the bootstrap.
pub struct Bootstrap<F> {
    fetcher: F,
    state: BootstrapState,
    failed_in: Option<BootstrapState>,

    node: Option<NodeMetadata>,
    token: Option<String>,
    rollout: Option<String>,
    config: Option<TelemetryConfig>,
}

impl<F: ConfigFetcher> Bootstrap<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            state: BootstrapState::FetchingMetadata,
            failed_in: None,
            node: None,
            token: None,
            rollout: None,
            config: None,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// State the machine failed in, when terminal.
    pub fn failed_in(&self) -> Option<BootstrapState> {
        self.failed_in
    }

    /// Performs one transition. Terminal states are no-ops.
    pub async fn step(&mut self) -> BootstrapState {
        match self.state {
            BootstrapState::FetchingMetadata => match self.fetcher.fetch_metadata().await {
                Ok(node) => {
                    self.node = Some(node);
                    self.state = BootstrapState::FetchingToken;
                }
                Err(e) => self.halt(e),
            },
            BootstrapState::FetchingToken => match self.fetcher.fetch_token().await {
                Ok(token) => {
                    self.token = Some(token);
                    self.state = BootstrapState::FetchingRollouts;
                }
                Err(e) => self.halt(e),
            },
            BootstrapState::FetchingRollouts => {
                let token = self.token.clone().unwrap_or_default();
                match self.fetcher.fetch_rollouts(&token).await {
                    Ok(rollouts) => match rollouts.into_iter().next() {
                        Some(rollout) => {
                            self.rollout = Some(rollout);
                            self.state = BootstrapState::FetchingConfigs;
                        }
                        None => self.halt(anyhow::anyhow!("no rollouts available")),
                    },
                    Err(e) => self.halt(e),
                }
            }
            BootstrapState::FetchingConfigs => {
                let token = self.token.clone().unwrap_or_default();
                let rollout = self.rollout.clone().unwrap_or_default();
                match self.fetcher.fetch_config(&token, &rollout).await {
                    Ok(config) => match config.validate() {
                        Ok(()) => {
                            self.config = Some(config);
                            self.state = BootstrapState::Applied;
                            info!(rollout = %rollout, "bootstrap applied");
                        }
                        Err(e) => self.halt(e.into()),
                    },
                    Err(e) => self.halt(e),
                }
            }
            BootstrapState::Applied | BootstrapState::Failed => {}
        }
        self.state
    }

    /// Runs transitions until the machine reaches a terminal state.
    /// Returns the applied bundle on success.
    pub async fn run(&mut self) -> Option<AppliedBundle> {
        loop {
            match self.step().await {
                BootstrapState::Applied => {
                    return Some(AppliedBundle {
                        node: self.node.clone()?,
                        config: self.config.clone()?,
                        rollout: self.rollout.clone()?,
                    });
                }
                BootstrapState::Failed => return None,
                _ => {}
            }
        }
    }

    fn halt(&mut self, error: anyhow::Error) {
        warn!(state = self.state.as_str(), error = %error, "bootstrap halted");
        self.failed_in = Some(self.state);
        self.state = BootstrapState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted fetcher failing at a chosen phase.
    struct ScriptedFetcher {
        fail_in: Option<BootstrapState>,
        calls: Vec<&'static str>,
    }

    impl ScriptedFetcher {
        fn new(fail_in: Option<BootstrapState>) -> Self {
            Self {
                fail_in,
                calls: Vec::new(),
            }
        }

        fn fails(&self, state: BootstrapState) -> bool {
            self.fail_in == Some(state)
        }
    }

    impl ConfigFetcher for ScriptedFetcher {
        async fn fetch_metadata(&mut self) -> Result<NodeMetadata> {
            self.calls.push("metadata");
            if self.fails(BootstrapState::FetchingMetadata) {
                anyhow::bail!("metadata unavailable");
            }
            Ok(NodeMetadata {
                name: "pod".to_string(),
                namespace: "ns".to_string(),
                ..Default::default()
            })
        }

        async fn fetch_token(&mut self) -> Result<String> {
            self.calls.push("token");
            if self.fails(BootstrapState::FetchingToken) {
                anyhow::bail!("token rejected");
            }
            Ok("token-1".to_string())
        }

        async fn fetch_rollouts(&mut self, token: &str) -> Result<Vec<String>> {
            self.calls.push("rollouts");
            assert_eq!(token, "token-1");
            if self.fails(BootstrapState::FetchingRollouts) {
                anyhow::bail!("rollouts unavailable");
            }
            Ok(vec!["r-2".to_string(), "r-1".to_string()])
        }

        async fn fetch_config(&mut self, _token: &str, rollout: &str) -> Result<TelemetryConfig> {
            self.calls.push("config");
            assert_eq!(rollout, "r-2", "newest rollout is fetched");
            if self.fails(BootstrapState::FetchingConfigs) {
                anyhow::bail!("config fetch failed");
            }
            Ok(TelemetryConfig::default())
        }
    }

    #[tokio::test]
    async fn test_bootstrap_walks_all_states_in_order() {
        let mut bootstrap = Bootstrap::new(ScriptedFetcher::new(None));
        assert_eq!(bootstrap.state(), BootstrapState::FetchingMetadata);
        assert_eq!(bootstrap.step().await, BootstrapState::FetchingToken);
        assert_eq!(bootstrap.step().await, BootstrapState::FetchingRollouts);
        assert_eq!(bootstrap.step().await, BootstrapState::FetchingConfigs);
        assert_eq!(bootstrap.step().await, BootstrapState::Applied);

        // Terminal state is sticky.
        assert_eq!(bootstrap.step().await, BootstrapState::Applied);
        assert_eq!(
            bootstrap.fetcher.calls,
            vec!["metadata", "token", "rollouts", "config"]
        );
    }

    #[tokio::test]
    async fn test_bootstrap_run_returns_bundle() {
        let mut bootstrap = Bootstrap::new(ScriptedFetcher::new(None));
        let bundle = bootstrap.run().await.expect("bootstrap succeeds");
        assert_eq!(bundle.node.name, "pod");
        assert_eq!(bundle.rollout, "r-2");
    }

    #[tokio::test]
    async fn test_bootstrap_halts_at_failing_state() {
        for fail_in in [
            BootstrapState::FetchingMetadata,
            BootstrapState::FetchingToken,
            BootstrapState::FetchingRollouts,
            BootstrapState::FetchingConfigs,
        ] {
            let mut bootstrap = Bootstrap::new(ScriptedFetcher::new(Some(fail_in)));
            assert!(bootstrap.run().await.is_none());
            assert_eq!(bootstrap.state(), BootstrapState::Failed);
            assert_eq!(bootstrap.failed_in(), Some(fail_in));
        }
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_invalid_fetched_config() {
        struct BadConfigFetcher(ScriptedFetcher);

        impl ConfigFetcher for BadConfigFetcher {
            async fn fetch_metadata(&mut self) -> Result<NodeMetadata> {
                self.0.fetch_metadata().await
            }
            async fn fetch_token(&mut self) -> Result<String> {
                self.0.fetch_token().await
            }
            async fn fetch_rollouts(&mut self, token: &str) -> Result<Vec<String>> {
                self.0.fetch_rollouts(token).await
            }
            async fn fetch_config(&mut self, _: &str, _: &str) -> Result<TelemetryConfig> {
                Ok(TelemetryConfig {
                    stat_prefix: String::new(),
                    ..Default::default()
                })
            }
        }

        let mut bootstrap = Bootstrap::new(BadConfigFetcher(ScriptedFetcher::new(None)));
        assert!(bootstrap.run().await.is_none());
        assert_eq!(bootstrap.failed_in(), Some(BootstrapState::FetchingConfigs));
    }
}
