//! topic.rs
//! Topic layout of one instance namespace.
//!
//! ```text
//! <prefix>/<mode>/<param>             command
//! <prefix>/<mode>/<param>/status      confirmation
//! <prefix>/<mode>/sync                start ("true") / stop ("false")
//! <prefix>/<mode>/sync/status         activation confirmation
//! <prefix>/<mode>/request_params      republish every confirmation of <mode>
//! <prefix>/deadband/{result,error,apply,applied}
//! ```
//!
//! Parsing is exact: a topic only belongs to this namespace if it starts with
//! `<prefix>/`, so `trains/a` never sees `trains/ab/...`.

use crate::device::params::{ExperimentMode, ParamKey};

const STATUS: &str = "status";
const SYNC: &str = "sync";
const REQUEST_PARAMS: &str = "request_params";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Command(ParamKey),
    Status(ParamKey),
    Sync(ExperimentMode),
    SyncStatus(ExperimentMode),
    RequestParams(ExperimentMode),
    DeadbandResult,
    DeadbandError,
    DeadbandApply,
    DeadbandApplied,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicSpace {
    prefix: String,
}

impl TopicSpace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn mode_topic(&self, mode: ExperimentMode, rest: &str) -> String {
        format!("{}/{}/{}", self.prefix, mode.segment(), rest)
    }

    pub fn command(&self, key: ParamKey) -> String {
        self.mode_topic(key.mode(), key.name())
    }

    pub fn status(&self, key: ParamKey) -> String {
        format!("{}/{}", self.command(key), STATUS)
    }

    pub fn sync(&self, mode: ExperimentMode) -> String {
        self.mode_topic(mode, SYNC)
    }

    pub fn sync_status(&self, mode: ExperimentMode) -> String {
        format!("{}/{}", self.sync(mode), STATUS)
    }

    pub fn request_params(&self, mode: ExperimentMode) -> String {
        self.mode_topic(mode, REQUEST_PARAMS)
    }

    pub fn deadband_result(&self) -> String {
        self.mode_topic(ExperimentMode::Deadband, "result")
    }

    pub fn deadband_error(&self) -> String {
        self.mode_topic(ExperimentMode::Deadband, "error")
    }

    pub fn deadband_apply(&self) -> String {
        self.mode_topic(ExperimentMode::Deadband, "apply")
    }

    pub fn deadband_applied(&self) -> String {
        self.mode_topic(ExperimentMode::Deadband, "applied")
    }

    /// Topics the device listens on.
    pub fn device_subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = ParamKey::ALL.iter().map(|k| self.command(*k)).collect();
        for mode in ExperimentMode::ACTIVE {
            topics.push(self.sync(mode));
            topics.push(self.request_params(mode));
        }
        topics.push(self.deadband_apply());
        topics
    }

    /// Topics the host listens on.
    pub fn host_subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = ParamKey::ALL.iter().map(|k| self.status(*k)).collect();
        for mode in ExperimentMode::ACTIVE {
            topics.push(self.sync_status(mode));
        }
        topics.push(self.deadband_result());
        topics.push(self.deadband_error());
        topics.push(self.deadband_applied());
        topics
    }

    /// Classify a topic of this namespace. `None` for foreign or unknown topics.
    pub fn parse(&self, topic: &str) -> Option<TopicKind> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let mode = ExperimentMode::from_segment(parts.next()?)?;
        let name = parts.next()?;
        let tail = parts.next();
        if parts.next().is_some() {
            return None;
        }

        match (name, tail) {
            (SYNC, None) => Some(TopicKind::Sync(mode)),
            (SYNC, Some(STATUS)) => Some(TopicKind::SyncStatus(mode)),
            (REQUEST_PARAMS, None) => Some(TopicKind::RequestParams(mode)),
            ("result", None) if mode == ExperimentMode::Deadband => Some(TopicKind::DeadbandResult),
            ("error", None) if mode == ExperimentMode::Deadband => Some(TopicKind::DeadbandError),
            ("apply", None) if mode == ExperimentMode::Deadband => Some(TopicKind::DeadbandApply),
            ("applied", None) if mode == ExperimentMode::Deadband => Some(TopicKind::DeadbandApplied),
            (param, None) => ParamKey::lookup(mode, param).map(TopicKind::Command),
            (param, Some(STATUS)) => ParamKey::lookup(mode, param).map(TopicKind::Status),
            _ => None,
        }
    }
}

/// `true`/`false` payloads of the sync topics.
pub fn parse_flag(payload: &str) -> Option<bool> {
    match payload.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Some(true),
        "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

pub fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}
