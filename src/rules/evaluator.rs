use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use hyper::{HeaderMap, StatusCode, header::{CONTENT_TYPE, HeaderValue}};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{info, warn};

use crate::{
    proxy::context::{ConnectContext, RequestContext, ResponseInfo},
    rules::{
        Rule, RuleError,
        parser::{Action, Hostname, Operator, RuleLine, load_rules_from_file, parse_rule_lines},
    },
};

/// Attributes of the exchange that rule conditions may refer to.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    tags: HashMap<String, String>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_connect(ctx: &ConnectContext) -> Self {
        let mut eval = Self::new();
        eval.insert("method", "CONNECT");
        eval.insert("scheme", ctx.protocol.as_str());
        if let Some(port) = ctx.port {
            eval.insert("port", &port.to_string());
        }
        eval
    }

    pub fn for_request(ctx: &RequestContext) -> Self {
        let mut eval = Self::new();
        let url = &ctx.request.url;
        eval.insert("method", ctx.request.method.as_str());
        eval.insert("scheme", url.scheme());
        eval.insert("path", url.path());
        if let Some(port) = url.port_or_known_default() {
            eval.insert("port", &port.to_string());
        }
        eval
    }

    fn insert(&mut self, key: &str, value: &str) {
        self.tags.insert(key.to_owned(), value.to_owned());
    }

    fn get(&self, key: &str) -> Option<&String> {
        self.tags.get(key)
    }
}

fn compare(left: &str, right: &str) -> std::cmp::Ordering {
    match (left.parse::<u64>(), right.parse::<u64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        _ => left.cmp(right),
    }
}

impl RuleLine {
    fn evaluate_condition(&self, context: &EvalContext) -> bool {
        use std::cmp::Ordering::*;

        for condition in &self.conditions {
            let Some(context_value) = context.get(&condition.key) else {
                return false;
            };
            let ordering = compare(context_value, &condition.value);
            let holds = match condition.operator {
                Operator::Equals => ordering == Equal,
                Operator::NotEquals => ordering != Equal,
                Operator::LessThan => ordering == Less,
                Operator::GreaterThan => ordering == Greater,
                Operator::LessThanOrEqual => ordering != Greater,
                Operator::GreaterThanOrEqual => ordering != Less,
            };
            if !holds {
                return false;
            }
        }
        true
    }
}

/// Rules read from a rule file, evaluated top to bottom; the first match wins.
pub struct RuleSet {
    lines: Vec<RuleLine>,
    regex_cache: Mutex<HashMap<String, Option<Regex>>>,
}

impl RuleSet {
    pub fn new(lines: Vec<RuleLine>) -> Self {
        Self {
            lines,
            regex_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn parse(mut input: &str) -> anyhow::Result<Self> {
        Ok(Self::new(parse_rule_lines(&mut input)?))
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(load_rules_from_file(path)?))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    fn applies_to(&self, line: &RuleLine, target_hostname: &str) -> bool {
        match line.hostname {
            Hostname::Exact(ref expected) => expected.eq_ignore_ascii_case(target_hostname),
            Hostname::Regex(ref pattern) => {
                let mut cache = self.regex_cache.lock();
                let regex = cache.entry(pattern.clone()).or_insert_with(|| {
                    // Anchored so that `example.com` does not match `notexample.com.evil`.
                    Regex::new(&format!("^(?:{pattern})$"))
                        .inspect_err(|e| warn!("Ignoring invalid host pattern `{pattern}`: {e}"))
                        .ok()
                });
                regex.as_ref().is_some_and(|regex| regex.is_match(target_hostname))
            }
        }
    }

    pub fn evaluate(&self, target_hostname: &str, context: &EvalContext) -> Option<&RuleLine> {
        self.lines
            .iter()
            .find(|line| self.applies_to(line, target_hostname) && line.evaluate_condition(context))
    }

    fn log_actions(line: &RuleLine, target: &str) {
        for action in &line.actions {
            if let Action::Log(message) = action {
                info!("{target}: {message}");
            }
        }
    }
}

fn intercept_decision(line: &RuleLine) -> Option<bool> {
    line.actions.iter().find_map(|action| match action {
        Action::Intercept => Some(true),
        Action::Bypass => Some(false),
        _ => None,
    })
}

#[async_trait]
impl Rule for RuleSet {
    fn summary(&self) -> String {
        format!("{} rules", self.len())
    }

    async fn is_deal_connect(&self, ctx: &ConnectContext) -> Result<Option<bool>, RuleError> {
        let Some(line) = self.evaluate(&ctx.host, &EvalContext::for_connect(ctx)) else {
            return Ok(None);
        };
        Self::log_actions(line, &ctx.host);
        Ok(intercept_decision(line))
    }

    async fn is_deal_request(&self, ctx: &mut RequestContext) -> Result<Option<bool>, RuleError> {
        let Some(line) = self.evaluate(ctx.host(), &EvalContext::for_request(ctx)) else {
            return Ok(None);
        };
        Self::log_actions(line, ctx.request.url.as_str());
        Ok(intercept_decision(line))
    }

    async fn is_wait_req_data(&self, ctx: &mut RequestContext) -> Result<(), RuleError> {
        if let Some(line) = self.evaluate(ctx.host(), &EvalContext::for_request(ctx)) {
            if line.actions.contains(&Action::Buffer) {
                ctx.wait_req_data = true;
                ctx.wait_res_data = true;
            }
        }
        Ok(())
    }

    async fn before_send_request(&self, ctx: &mut RequestContext) -> Result<(), RuleError> {
        let Some(line) = self.evaluate(ctx.host(), &EvalContext::for_request(ctx)).cloned() else {
            return Ok(());
        };

        for action in &line.actions {
            match action {
                Action::Deny => {
                    let mut headers = HeaderMap::new();
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
                    ctx.response = Some(ResponseInfo::new(
                        StatusCode::FORBIDDEN,
                        headers,
                        "Blocked by a passeur rule\n",
                    ));
                    return Ok(());
                }
                Action::Redirect(authority) => redirect(ctx, authority)?,
                _ => {}
            }
        }
        Ok(())
    }
}

fn redirect(ctx: &mut RequestContext, authority: &str) -> Result<(), RuleError> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| RuleError::Invalid(format!("bad redirect port in `{authority}`")))?;
            (host, Some(port))
        }
        None => (authority, None),
    };

    let url = &mut ctx.request.url;
    url.set_host(Some(host))
        .map_err(|e| RuleError::Invalid(format!("bad redirect host `{host}`: {e}")))?;
    url.set_port(port)
        .map_err(|_| RuleError::Invalid(format!("cannot set a port for `{host}`")))?;
    info!("Redirecting {} to {}", ctx.raw_request.url, ctx.request.url);
    Ok(())
}
