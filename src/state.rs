use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::{
    config::Settings,
    rules::{DefaultRule, Rule, RuleSet},
};

/// What can change while the proxy runs.
pub struct State {
    /// Requests clone this `Arc` when they start; a reload only affects later requests.
    pub rule: Arc<dyn Rule>,
}

fn load_rule(settings: &Settings) -> anyhow::Result<Arc<dyn Rule>> {
    match settings.rule_file {
        Some(ref path) => {
            let rules = RuleSet::from_file(path)
                .with_context(|| format!("while loading rules from {}", path.display()))?;
            Ok(Arc::new(rules))
        }
        None => Ok(Arc::new(DefaultRule)),
    }
}

impl State {
    pub fn with_rule(rule: Arc<dyn Rule>) -> Self {
        Self { rule }
    }

    /// Re-reads the rule file. On failure the active rule is kept.
    pub fn reload_rule(&mut self, settings: &Settings) -> anyhow::Result<()> {
        self.rule = load_rule(settings)?;
        info!("Active rule: {}", self.rule.summary());
        Ok(())
    }
}

pub fn init(settings: &Settings) -> anyhow::Result<State> {
    let rule = load_rule(settings)?;
    info!("Active rule: {}", rule.summary());
    Ok(State::with_rule(rule))
}
