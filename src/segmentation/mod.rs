//! Traffic-segmentation rule engine: matches a request context against an
//! ordered rule list using a specificity score, and emits a decision
//! (action + shaping policy).
//!
//! Grounded on `segmentedproxy.segmentation`.

pub mod rules;

use globset::{Glob, GlobMatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationMode {
    Direct,
    SegmentUpstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationStrategy {
    None,
    Fixed,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Direct,
    Upstream,
    Block,
}

#[derive(Debug, Clone)]
pub struct SegmentationPolicy {
    pub mode: SegmentationMode,
    pub strategy: SegmentationStrategy,
    pub chunk_size: usize,
    pub delay_ms: u64,
    pub min_chunk: Option<usize>,
    pub max_chunk: Option<usize>,
}

impl Default for SegmentationPolicy {
    fn default() -> Self {
        SegmentationPolicy {
            mode: SegmentationMode::Direct,
            strategy: SegmentationStrategy::None,
            chunk_size: 1024,
            delay_ms: 0,
            min_chunk: None,
            max_chunk: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentationRule {
    pub host_glob: String,
    pub matcher: RuleMatcher,
    pub policy: SegmentationPolicy,
    pub action: RuleAction,
    pub upstream: Option<(String, u16)>,
    pub reason: Option<String>,
    pub scheme: Option<String>,
    pub method: Option<String>,
    pub path_prefix: Option<String>,
}

/// A compiled `host_glob` matcher, kept alongside the rule so hostnames are
/// only compiled once (at rule construction), not on every request.
#[derive(Debug, Clone)]
pub struct RuleMatcher(GlobMatcher);

impl RuleMatcher {
    pub fn compile(pattern: &str) -> Result<Self, String> {
        let glob = Glob::new(pattern).map_err(|e| format!("invalid host glob '{pattern}': {e}"))?;
        Ok(RuleMatcher(glob.compile_matcher()))
    }

    pub fn is_match(&self, host: &str) -> bool {
        self.0.is_match(host)
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct SegmentationDecision {
    pub action: RuleAction,
    pub policy: SegmentationPolicy,
    pub upstream: Option<(String, u16)>,
    pub matched_rule_reason: Option<String>,
    pub score: i64,
    pub explain: String,
}

pub struct SegmentationEngine {
    rules: Vec<SegmentationRule>,
    default: SegmentationPolicy,
}

impl SegmentationEngine {
    pub fn new(rules: Vec<SegmentationRule>, default: SegmentationPolicy) -> Self {
        SegmentationEngine { rules, default }
    }

    pub fn decide(&self, ctx: &RequestContext) -> SegmentationDecision {
        let mut best: Option<(&SegmentationRule, i64)> = None;

        for rule in &self.rules {
            if !rule_matches(ctx, rule) {
                continue;
            }
            let score = rule_score(rule);
            match best {
                None => best = Some((rule, score)),
                Some((best_rule, best_score)) => {
                    if score > best_score {
                        best = Some((rule, score));
                    } else if score == best_score && action_preferred(rule.action, best_rule.action) {
                        best = Some((rule, score));
                    }
                }
            }
        }

        match best {
            None => SegmentationDecision {
                action: RuleAction::Direct,
                policy: self.default.clone(),
                upstream: None,
                matched_rule_reason: None,
                score: -1,
                explain: "no rule matched; using default policy".to_string(),
            },
            Some((rule, score)) => SegmentationDecision {
                action: rule.action,
                policy: rule.policy.clone(),
                upstream: rule.upstream.clone(),
                matched_rule_reason: rule.reason.clone(),
                score,
                explain: format_explain(ctx, rule, score),
            },
        }
    }
}

fn rule_matches(ctx: &RequestContext, rule: &SegmentationRule) -> bool {
    if !rule.matcher.is_match(&ctx.host) {
        return false;
    }
    if let Some(scheme) = &rule.scheme {
        if scheme != &ctx.scheme {
            return false;
        }
    }
    if let Some(method) = &rule.method {
        if method != &ctx.method.to_ascii_uppercase() {
            return false;
        }
    }
    if let Some(prefix) = &rule.path_prefix {
        if !ctx.path.starts_with(prefix.as_str()) {
            return false;
        }
    }
    true
}

fn rule_score(rule: &SegmentationRule) -> i64 {
    let mut score = 0i64;
    let glob = rule.host_glob.as_str();

    if !glob.is_empty() && glob != "*" {
        score += 1000;
    }
    if !glob.contains('*') && !glob.contains('?') {
        score += 500;
    } else if glob.starts_with("*.") {
        score += 200;
    }

    if rule.scheme.is_some() {
        score += 100;
    }
    if rule.method.is_some() {
        score += 100;
    }
    if let Some(prefix) = &rule.path_prefix {
        score += prefix.len() as i64;
    }

    score
}

fn action_preferred(candidate: RuleAction, current: RuleAction) -> bool {
    matches!(candidate, RuleAction::Block) && !matches!(current, RuleAction::Block)
}

fn format_explain(ctx: &RequestContext, rule: &SegmentationRule, score: i64) -> String {
    let mut parts = vec![format!("host_glob={}", rule.host_glob)];
    if let Some(s) = &rule.scheme {
        parts.push(format!("scheme={s}"));
    }
    if let Some(m) = &rule.method {
        parts.push(format!("method={m}"));
    }
    if let Some(p) = &rule.path_prefix {
        parts.push(format!("path_prefix={p}"));
    }

    format!(
        "matched {}; ctx host={} scheme={} method={} path={}; score={}; action={:?}",
        parts.join(" "),
        ctx.host,
        ctx.scheme,
        ctx.method.to_ascii_uppercase(),
        ctx.path,
        score,
        rule.action
    )
}
