//! Approval gate: extract and normalize risk-classified action requests
//! embedded in generated text.
//!
//! Generated output may wrap at most one structured request per delimited
//! block. This module only parses and validates; it performs no execution
//! and no persistence. Malformed blocks are silently skipped since not
//! all generated text is a request.

use chrono::{DateTime, Utc};
use regex::Regex;

pub const ACTION_BEGIN: &str = "[[ACTION_REQUEST]]";
pub const ACTION_END: &str = "[[/ACTION_REQUEST]]";

/// The fixed set of gated operations. Unknown actions are rejected,
/// never defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatedAction {
    EnqueueTask,
    EnqueueAgenticTask,
    KillTaskRun,
    QueryCentralDb,
}

impl GatedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            GatedAction::EnqueueTask => "enqueue_task",
            GatedAction::EnqueueAgenticTask => "enqueue_agentic_task",
            GatedAction::KillTaskRun => "kill_task_run",
            GatedAction::QueryCentralDb => "query_central_db",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "enqueue_task" => Some(GatedAction::EnqueueTask),
            "enqueue_agentic_task" => Some(GatedAction::EnqueueAgenticTask),
            "kill_task_run" => Some(GatedAction::KillTaskRun),
            "query_central_db" => Some(GatedAction::QueryCentralDb),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            _ => None,
        }
    }
}

/// Raw shape of the JSON object inside a block, before normalization.
#[derive(Debug, serde::Deserialize)]
struct RawRequest {
    action: String,
    #[serde(default)]
    action_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    risk_level: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    requested_by_route: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
}

/// A validated, normalized action request awaiting human approval.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApprovalRequest {
    pub action_id: String,
    pub action: GatedAction,
    pub title: String,
    pub risk_level: RiskLevel,
    pub payload: serde_json::Value,
    pub requested_by_route: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// A request with no expiry never expires. An unparseable `expires_at`
    /// was already normalized to "never expires" at parse time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }
}

/// Parse the single request inside one delimited block body, if it is
/// well formed. Returns None for malformed JSON, unknown actions, and
/// empty action ids.
pub fn parse_block(block: &str, default_route: &str) -> Option<ApprovalRequest> {
    let raw: RawRequest = serde_json::from_str(block.trim()).ok()?;
    let action = GatedAction::from_name(&raw.action)?;
    if raw.action_id.trim().is_empty() {
        return None;
    }
    // Out-of-range risk levels coerce to medium rather than rejecting.
    let risk_level = raw
        .risk_level
        .as_deref()
        .and_then(RiskLevel::from_name)
        .unwrap_or(RiskLevel::Medium);
    let expires_at = raw
        .expires_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Some(ApprovalRequest {
        action_id: raw.action_id,
        action,
        title: raw.title,
        risk_level,
        payload: raw.payload,
        requested_by_route: raw
            .requested_by_route
            .unwrap_or_else(|| default_route.to_string()),
        expires_at,
    })
}

/// Extract every well-formed action request from a piece of generated
/// text. Blocks that fail to parse are skipped without aborting the rest
/// of the text.
pub fn extract_requests(text: &str, default_route: &str) -> Vec<ApprovalRequest> {
    let re = Regex::new(r"(?s)\[\[ACTION_REQUEST\]\](.*?)\[\[/ACTION_REQUEST\]\]").unwrap();
    re.captures_iter(text)
        .filter_map(|caps| parse_block(&caps[1], default_route))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn wrap(body: &str) -> String {
        format!("{}\n{}\n{}", ACTION_BEGIN, body, ACTION_END)
    }

    #[test]
    fn extracts_valid_request_with_defaults() {
        let text = format!(
            "Here is what I propose.\n{}",
            wrap(r#"{"action": "enqueue_task", "action_id": "a-1", "title": "Sweep inbox"}"#)
        );
        let reqs = extract_requests(&text, "assistant/main");
        assert_eq!(reqs.len(), 1);
        let req = &reqs[0];
        assert_eq!(req.action, GatedAction::EnqueueTask);
        assert_eq!(req.action_id, "a-1");
        assert_eq!(req.risk_level, RiskLevel::Medium);
        assert_eq!(req.requested_by_route, "assistant/main");
        assert!(req.expires_at.is_none());
    }

    #[test]
    fn unknown_action_yields_no_request() {
        let text = wrap(r#"{"action": "format_disk", "action_id": "a-2"}"#);
        assert!(extract_requests(&text, "r").is_empty());
    }

    #[test]
    fn empty_action_id_yields_no_request() {
        let text = wrap(r#"{"action": "kill_task_run", "action_id": "  "}"#);
        assert!(extract_requests(&text, "r").is_empty());
    }

    #[test]
    fn malformed_block_is_skipped_without_aborting_others() {
        let text = format!(
            "{}\n{}",
            wrap("{not json at all"),
            wrap(r#"{"action": "query_central_db", "action_id": "a-3", "risk_level": "high"}"#)
        );
        let reqs = extract_requests(&text, "r");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].risk_level, RiskLevel::High);
    }

    #[test]
    fn out_of_range_risk_level_coerces_to_medium() {
        let text = wrap(r#"{"action": "enqueue_task", "action_id": "a-4", "risk_level": "extreme"}"#);
        let reqs = extract_requests(&text, "r");
        assert_eq!(reqs[0].risk_level, RiskLevel::Medium);
    }

    #[test]
    fn unparseable_expiry_means_never_expires() {
        let text = wrap(
            r#"{"action": "enqueue_task", "action_id": "a-5", "expires_at": "next tuesday"}"#,
        );
        let reqs = extract_requests(&text, "r");
        assert!(reqs[0].expires_at.is_none());
        assert!(!reqs[0].is_expired(Utc::now()));
    }

    #[test]
    fn absolute_expiry_is_checkable() {
        let text = wrap(
            r#"{"action": "enqueue_task", "action_id": "a-6", "expires_at": "2026-01-01T00:00:00Z"}"#,
        );
        let reqs = extract_requests(&text, "r");
        let before = Utc.with_ymd_and_hms(2025, 12, 31, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        assert!(!reqs[0].is_expired(before));
        assert!(reqs[0].is_expired(after));
    }

    #[test]
    fn plain_text_without_markers_yields_nothing() {
        assert!(extract_requests("just an ordinary answer", "r").is_empty());
    }
}
