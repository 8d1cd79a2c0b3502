use std::path::Path;
use anyhow::Context;
use winnow::{
    ModalResult, Parser, ascii::{Caseless, multispace0, multispace1, space1, till_line_ending}, combinator::{alt, opt, preceded, repeat, separated}, error::{ContextError, ParseError, StrContext}, stream::AsChar, token::{take_till, take_while}
};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Intercept,
    Bypass,
    Buffer,
    Deny,
    Redirect(String), // Authority replacing the requested one
    Log(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operator {
    Equals,
    NotEquals,
    LessThan,
    GreaterThan,
    LessThanOrEqual,
    GreaterThanOrEqual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub key: String,
    pub value: String,
    pub operator: Operator,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Hostname {
    Exact(String),
    Regex(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleLine {
    pub hostname: Hostname,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

#[derive(Debug)]
pub struct RuleSyntaxError {
    message: String,
    span: std::ops::Range<usize>,
    input: String,
}

impl RuleSyntaxError {
    fn from_parse(error: ParseError<&str, ContextError>) -> Self {
        Self {
            message: error.inner().to_string(),
            input: (*error.input()).to_owned(),
            span: error.char_span()
        }
    }
}

impl std::fmt::Display for RuleSyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = annotate_snippets::Level::ERROR.primary_title(&self.message)
            .element(annotate_snippets::Snippet::source(&self.input)
                .fold(true)
                .annotation(annotate_snippets::AnnotationKind::Primary.span(self.span.clone()))
            );
        let renderer = annotate_snippets::Renderer::plain();
        let rendered = renderer.render(&[message]);
        rendered.fmt(f)
    }
}

impl std::error::Error for RuleSyntaxError { }

fn is_token_end(c: char) -> bool {
    c.is_space() || c == '\r' || c == '\n'
}

fn parse_hostname(input: &mut &str) -> ModalResult<Hostname> {
    alt((
        // `=host` matches that host only, anything else is a regex.
        preceded('=', take_till(1.., is_token_end))
            .map(|hostname: &str| Hostname::Exact(hostname.to_string())),
        take_till(1.., is_token_end)
            .verify(|regex: &str| !regex.starts_with('#'))
            .map(|regex: &str| Hostname::Regex(regex.to_string())),
    )).parse_next(input)
}

fn parse_operator(input: &mut &str) -> ModalResult<Operator> {
    alt((
        "!=".map(|_| Operator::NotEquals),
        "<=".map(|_| Operator::LessThanOrEqual),
        ">=".map(|_| Operator::GreaterThanOrEqual),
        '='.map(|_| Operator::Equals),
        "<".map(|_| Operator::LessThan),
        ">".map(|_| Operator::GreaterThan),
    )).parse_next(input)
}

fn parse_key<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    take_while(
        1..,
        |c: char| c.is_alphanumeric() || c == '.' || c == '_'
    ).parse_next(input)
}

fn parse_condition_with_operator(input: &mut &str) -> ModalResult<Condition> {
    (parse_key.context(StrContext::Label("condition identifier")), parse_operator.context(StrContext::Label("condition operator")), take_till(1.., is_token_end).context(StrContext::Label("condition value")))
        .map(|(key, operator, value): (&str, Operator, &str)| Condition {
            key: key.to_string(),
            value: value.to_string(),
            operator,
        })
        .parse_next(input)
}

fn parse_action(input: &mut &str) -> ModalResult<Action> {
    alt((
        Caseless("intercept").map(|_| Action::Intercept),
        Caseless("bypass").map(|_| Action::Bypass),
        Caseless("buffer").map(|_| Action::Buffer),
        Caseless("deny").map(|_| Action::Deny),
        preceded(Caseless("redirect="), take_till(1.., |c: char| c == ',' || is_token_end(c)))
            .map(|s: &str| Action::Redirect(s.to_string())),
        preceded(Caseless("log="), take_till(1.., |c: char| c == ',' || c == '\r' || c == '\n'))
            .map(|s: &str| Action::Log(s.trim_end().to_string())),
    )).parse_next(input)
}

fn parse_actions(input: &mut &str) -> ModalResult<Vec<Action>> {
    separated(1.., parse_action.context(StrContext::Label("action")), ',').parse_next(input)
}

fn parse_conditions(input: &mut &str) -> ModalResult<Vec<Condition>> {
    repeat(0.., preceded(space1, parse_condition_with_operator.context(StrContext::Label("condition")))).parse_next(input)
}

fn parse_comment<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    preceded('#', till_line_ending).parse_next(input)
}

fn parse_comments_or_empty(input: &mut &str) -> ModalResult<()> {
    repeat(1..,
        alt((
            multispace1.context(StrContext::Label("empty line")).void(),
            parse_comment.context(StrContext::Label("comment")).void(),
        )).void()
    )
    .parse_next(input)
}

fn parse_rule_line(input: &mut &str) -> ModalResult<RuleLine> {
    (
        opt(parse_comments_or_empty),
        parse_hostname.context(StrContext::Label("hostname")),
        parse_conditions.context(StrContext::Label("conditions")),
        space1,
        "->",
        space1,
        parse_actions.context(StrContext::Label("actions")),
        till_line_ending,
        multispace0,
    )
    .map(|(_, hostname, conditions, _, _, _, actions, _, _)| RuleLine {
        hostname,
        conditions,
        actions,
    })
    .parse_next(input)
}

pub fn parse_rule_lines(input: &mut &str) -> Result<Vec<RuleLine>, RuleSyntaxError> {
    (
        repeat(0.., parse_rule_line.context(StrContext::Label("rule"))),
        opt(parse_comments_or_empty),
    )
    .map(|(rules, _): (Vec<RuleLine>, _)| rules)
    .parse(*input)
    .map_err(RuleSyntaxError::from_parse)
}

pub fn load_rules_from_file(path: &Path) -> anyhow::Result<Vec<RuleLine>> {
    let contents = String::from_utf8_lossy(&std::fs::read(path).context("while reading rule file")?).into_owned();
    let rules = parse_rule_lines(&mut contents.as_str()).context("while parsing rules")?;
    info!("Parsed {} rules from {}", rules.len(), path.display());
    Ok(rules)
}
