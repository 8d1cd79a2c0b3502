//! The interception hooks consulted by the proxy, and the rule file
//! implementation of them.

mod evaluator;
mod parser;

use async_trait::async_trait;
use thiserror::Error;

use crate::proxy::{
    context::{ConnectContext, RequestContext, WsContext},
    ConnectError, PipelineError,
};

pub use evaluator::RuleSet;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Invalid rule outcome: {0}")]
    Invalid(String),
    #[error("Rule failed: {0}")]
    Failed(#[from] anyhow::Error),
}

/// Every hook has a default that lets traffic through untouched, so a rule
/// only implements what it cares about.
///
/// Hooks may mutate the context they receive. An error returned by any hook
/// other than `on_error`/`on_connect_error` turns the exchange into an error
/// response.
#[async_trait]
pub trait Rule: Send + Sync {
    fn summary(&self) -> String {
        "pass-through".to_owned()
    }

    /// `Some(false)` tunnels the CONNECT without decrypting it.
    async fn is_deal_connect(&self, _ctx: &ConnectContext) -> Result<Option<bool>, RuleError> {
        Ok(None)
    }

    /// `Some(false)` relays the exchange verbatim, skipping every later hook.
    async fn is_deal_request(&self, _ctx: &mut RequestContext) -> Result<Option<bool>, RuleError> {
        Ok(None)
    }

    /// May set `wait_req_data` and `wait_res_data`.
    async fn is_wait_req_data(&self, _ctx: &mut RequestContext) -> Result<(), RuleError> {
        Ok(())
    }

    /// May rewrite `ctx.request`, or set `ctx.response` to answer without contacting upstream.
    async fn before_send_request(&self, _ctx: &mut RequestContext) -> Result<(), RuleError> {
        Ok(())
    }

    async fn before_send_response(&self, _ctx: &mut RequestContext) -> Result<(), RuleError> {
        Ok(())
    }

    async fn before_ws_client(&self, _ctx: &mut WsContext) -> Result<(), RuleError> {
        Ok(())
    }

    /// May replace `ctx.response`, which already holds the default error page.
    async fn on_error(&self, _error: &PipelineError, _ctx: &mut RequestContext) -> Result<(), RuleError> {
        Ok(())
    }

    async fn on_connect_error(&self, _error: &ConnectError, _ctx: &ConnectContext) -> Result<(), RuleError> {
        Ok(())
    }
}

/// Used when no rule file is configured.
pub struct DefaultRule;

impl Rule for DefaultRule {}
