//! Rule-text grammar: `<host_glob>=<mode>(,<key>=<value>)*`, one rule per
//! line. Grounded on `segmentedproxy.segmentation.parse_rule_line`.

use super::{RuleAction, RuleMatcher, SegmentationMode, SegmentationPolicy, SegmentationRule, SegmentationStrategy};

#[derive(Debug, Clone)]
pub struct RuleParseError {
    pub line: Option<usize>,
    pub message: String,
}

impl std::fmt::Display for RuleParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RuleParseError {}

fn err(line: Option<usize>, message: impl Into<String>) -> RuleParseError {
    RuleParseError {
        line,
        message: message.into(),
    }
}

/// Parses a rules file (one rule per line). Blank lines and `#` comments
/// are skipped. Errors carry the 1-based line number.
pub fn parse_rules_file(text: &str) -> Result<Vec<SegmentationRule>, RuleParseError> {
    let mut rules = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let rule = parse_segment_rule(line).map_err(|e| err(Some(lineno), e.message))?;
        rules.push(rule);
    }
    Ok(rules)
}

/// Parses a single rule line (as given on the CLI via `--segment-rule`, or
/// from a rules file once comment/blank handling has already run).
pub fn parse_segment_rule(line: &str) -> Result<SegmentationRule, RuleParseError> {
    let (host_glob, rest) = line
        .split_once('=')
        .ok_or_else(|| err(None, format!("missing '=' in rule: {line}")))?;
    let host_glob = host_glob.trim();
    if host_glob.is_empty() {
        return Err(err(None, "host_glob must not be empty"));
    }

    let mut parts = rest.split(',');
    let mode_token = parts
        .next()
        .ok_or_else(|| err(None, "missing mode after '='"))?
        .trim();
    let mode = parse_mode(mode_token)?;

    let mut policy = SegmentationPolicy {
        mode,
        ..SegmentationPolicy::default()
    };
    let mut action = RuleAction::Direct;
    let mut upstream: Option<(String, u16)> = None;
    let mut reason = None;
    let mut scheme = None;
    let mut method = None;
    let mut path_prefix = None;

    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| err(None, format!("malformed key=value pair: {part}")))?;
        let key = key.trim();
        let value = value.trim();

        match key {
            "strategy" => policy.strategy = parse_strategy(value)?,
            "chunk" => policy.chunk_size = parse_usize(value, "chunk")?,
            "min" | "chunk_min" => policy.min_chunk = Some(parse_usize(value, key)?),
            "max" | "chunk_max" => policy.max_chunk = Some(parse_usize(value, key)?),
            "delay" => policy.delay_ms = parse_u64(value, "delay")?,
            "action" => action = parse_action(value)?,
            "upstream" => upstream = Some(parse_upstream(value)?),
            "reason" => reason = Some(value.to_string()),
            "scheme" => scheme = Some(parse_scheme(value)?),
            "method" => method = Some(value.to_ascii_uppercase()),
            "path_prefix" => {
                let p = if value.starts_with('/') {
                    value.to_string()
                } else {
                    format!("/{value}")
                };
                path_prefix = Some(p);
            }
            other => return Err(err(None, format!("unrecognized rule key: {other}"))),
        }
    }

    if policy.strategy == SegmentationStrategy::Random
        && (policy.min_chunk.is_none() || policy.max_chunk.is_none())
    {
        return Err(err(None, "strategy=random requires both min and max chunk bounds"));
    }
    if let (Some(min), Some(max)) = (policy.min_chunk, policy.max_chunk) {
        if min > max {
            return Err(err(None, "min_chunk must not exceed max_chunk"));
        }
    }
    if policy.strategy == SegmentationStrategy::Fixed && policy.chunk_size == 0 {
        return Err(err(None, "strategy=fixed requires chunk_size > 0"));
    }

    match action {
        RuleAction::Upstream if upstream.is_none() => {
            return Err(err(None, "action=upstream requires an upstream=host:port value"));
        }
        RuleAction::Block if upstream.is_some() => {
            return Err(err(None, "action=block must not specify an upstream"));
        }
        RuleAction::Direct if upstream.is_some() => {
            return Err(err(None, "action=direct must not specify an upstream"));
        }
        _ => {}
    }

    let matcher = RuleMatcher::compile(host_glob).map_err(|e| err(None, e))?;

    Ok(SegmentationRule {
        host_glob: host_glob.to_string(),
        matcher,
        policy,
        action,
        upstream,
        reason,
        scheme,
        method,
        path_prefix,
    })
}

/// Unrecognized mode tokens degrade to `direct` rather than failing parse.
fn parse_mode(value: &str) -> Result<SegmentationMode, RuleParseError> {
    match value {
        "segment_upstream" => Ok(SegmentationMode::SegmentUpstream),
        _ => Ok(SegmentationMode::Direct),
    }
}

fn parse_strategy(value: &str) -> Result<SegmentationStrategy, RuleParseError> {
    match value {
        "none" => Ok(SegmentationStrategy::None),
        "fixed" => Ok(SegmentationStrategy::Fixed),
        "random" => Ok(SegmentationStrategy::Random),
        other => Err(err(None, format!("unknown strategy: {other}"))),
    }
}

fn parse_action(value: &str) -> Result<RuleAction, RuleParseError> {
    match value {
        "direct" => Ok(RuleAction::Direct),
        "upstream" => Ok(RuleAction::Upstream),
        "block" => Ok(RuleAction::Block),
        other => Err(err(None, format!("unknown action: {other}"))),
    }
}

fn parse_scheme(value: &str) -> Result<String, RuleParseError> {
    match value {
        "http" | "https" => Ok(value.to_string()),
        other => Err(err(None, format!("unknown scheme: {other}"))),
    }
}

fn parse_upstream(value: &str) -> Result<(String, u16), RuleParseError> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| err(None, format!("upstream must be host:port, got: {value}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| err(None, format!("invalid upstream port: {port}")))?;
    if host.is_empty() {
        return Err(err(None, "upstream host must not be empty"));
    }
    Ok((host.to_string(), port))
}

fn parse_usize(value: &str, field: &str) -> Result<usize, RuleParseError> {
    value
        .parse()
        .map_err(|_| err(None, format!("invalid integer for {field}: {value}")))
}

fn parse_u64(value: &str, field: &str) -> Result<u64, RuleParseError> {
    value
        .parse()
        .map_err(|_| err(None, format!("invalid integer for {field}: {value}")))
}

/// Formats a rule back into its text grammar, the inverse of
/// `parse_segment_rule`. Used by `--validate-rules` to echo a normalized
/// rule set.
pub fn format_rule(rule: &SegmentationRule) -> String {
    let mode = match rule.policy.mode {
        SegmentationMode::Direct => "direct",
        SegmentationMode::SegmentUpstream => "segment_upstream",
    };
    let mut out = format!("{}={}", rule.host_glob, mode);

    let strategy = match rule.policy.strategy {
        SegmentationStrategy::None => "none",
        SegmentationStrategy::Fixed => "fixed",
        SegmentationStrategy::Random => "random",
    };
    out.push_str(&format!(",strategy={strategy}"));
    out.push_str(&format!(",chunk={}", rule.policy.chunk_size));
    if let Some(min) = rule.policy.min_chunk {
        out.push_str(&format!(",min={min}"));
    }
    if let Some(max) = rule.policy.max_chunk {
        out.push_str(&format!(",max={max}"));
    }
    if rule.policy.delay_ms > 0 {
        out.push_str(&format!(",delay={}", rule.policy.delay_ms));
    }

    let action = match rule.action {
        RuleAction::Direct => "direct",
        RuleAction::Upstream => "upstream",
        RuleAction::Block => "block",
    };
    out.push_str(&format!(",action={action}"));

    if let Some((host, port)) = &rule.upstream {
        out.push_str(&format!(",upstream={host}:{port}"));
    }
    if let Some(reason) = &rule.reason {
        out.push_str(&format!(",reason={reason}"));
    }
    if let Some(scheme) = &rule.scheme {
        out.push_str(&format!(",scheme={scheme}"));
    }
    if let Some(method) = &rule.method {
        out.push_str(&format!(",method={method}"));
    }
    if let Some(prefix) = &rule.path_prefix {
        out.push_str(&format!(",path_prefix={prefix}"));
    }

    out
}
