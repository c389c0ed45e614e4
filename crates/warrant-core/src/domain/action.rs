//! Closed action-identifier vocabulary.
//!
//! Every effect an agent can attempt is named by an [`ActionId`]. The set is
//! closed and grouped by capability domain; anything else parses to
//! [`ActionId::Unknown`], which the policy kernel denies before dispatch.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::string_id;

string_id!(
    /// Shared external resource arbitrated by one token bucket (e.g. "web").
    ResourceClass
);

/// Capability domain an action belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDomain {
    Tree,
    Web,
    Mail,
    Calendar,
    Files,
    Media,
}

impl ActionDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionDomain::Tree => "tree",
            ActionDomain::Web => "web",
            ActionDomain::Mail => "mail",
            ActionDomain::Calendar => "calendar",
            ActionDomain::Files => "files",
            ActionDomain::Media => "media",
        }
    }
}

/// How an allowed action is charged against a task budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionClass {
    /// Local tool call; counts against `max_tool_calls`.
    Tool,
    /// Leaves the process; counts against both `max_tool_calls` and
    /// `max_external_requests`, and draws from the resource class bucket.
    ExternalRequest(ResourceClass),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionId {
    // tree
    Read,
    Navigate,
    Search,
    Create,
    Update,
    Delete,
    Relate,
    // web
    WebSearch,
    WebFetch,
    // mail
    MailRead,
    MailSend,
    // calendar
    CalendarRead,
    CalendarWrite,
    // files
    FilesRead,
    FilesWrite,
    // media
    ImageGenerate,
    /// Anything outside the vocabulary. Never allowed.
    Unknown(String),
}

impl ActionId {
    /// Every known action, in declaration order.
    pub const KNOWN: [ActionId; 16] = [
        ActionId::Read,
        ActionId::Navigate,
        ActionId::Search,
        ActionId::Create,
        ActionId::Update,
        ActionId::Delete,
        ActionId::Relate,
        ActionId::WebSearch,
        ActionId::WebFetch,
        ActionId::MailRead,
        ActionId::MailSend,
        ActionId::CalendarRead,
        ActionId::CalendarWrite,
        ActionId::FilesRead,
        ActionId::FilesWrite,
        ActionId::ImageGenerate,
    ];

    /// Parse a wire name. Never fails: unrecognised names become `Unknown`.
    ///
    /// Matching is exact; "Delete" or " delete" are unknown actions, not
    /// aliases.
    pub fn parse(name: &str) -> Self {
        match name {
            "read" => ActionId::Read,
            "navigate" => ActionId::Navigate,
            "search" => ActionId::Search,
            "create" => ActionId::Create,
            "update" => ActionId::Update,
            "delete" => ActionId::Delete,
            "relate" => ActionId::Relate,
            "web.search" => ActionId::WebSearch,
            "web.fetch" => ActionId::WebFetch,
            "mail.read" => ActionId::MailRead,
            "mail.send" => ActionId::MailSend,
            "calendar.read" => ActionId::CalendarRead,
            "calendar.write" => ActionId::CalendarWrite,
            "files.read" => ActionId::FilesRead,
            "files.write" => ActionId::FilesWrite,
            "media.generate_image" => ActionId::ImageGenerate,
            other => ActionId::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActionId::Read => "read",
            ActionId::Navigate => "navigate",
            ActionId::Search => "search",
            ActionId::Create => "create",
            ActionId::Update => "update",
            ActionId::Delete => "delete",
            ActionId::Relate => "relate",
            ActionId::WebSearch => "web.search",
            ActionId::WebFetch => "web.fetch",
            ActionId::MailRead => "mail.read",
            ActionId::MailSend => "mail.send",
            ActionId::CalendarRead => "calendar.read",
            ActionId::CalendarWrite => "calendar.write",
            ActionId::FilesRead => "files.read",
            ActionId::FilesWrite => "files.write",
            ActionId::ImageGenerate => "media.generate_image",
            ActionId::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ActionId::Unknown(_))
    }

    pub fn domain(&self) -> Option<ActionDomain> {
        let domain = match self {
            ActionId::Read
            | ActionId::Navigate
            | ActionId::Search
            | ActionId::Create
            | ActionId::Update
            | ActionId::Delete
            | ActionId::Relate => ActionDomain::Tree,
            ActionId::WebSearch | ActionId::WebFetch => ActionDomain::Web,
            ActionId::MailRead | ActionId::MailSend => ActionDomain::Mail,
            ActionId::CalendarRead | ActionId::CalendarWrite => ActionDomain::Calendar,
            ActionId::FilesRead | ActionId::FilesWrite => ActionDomain::Files,
            ActionId::ImageGenerate => ActionDomain::Media,
            ActionId::Unknown(_) => return None,
        };
        Some(domain)
    }

    /// Budget class. Everything outside the tree domain leaves the process.
    pub fn class(&self) -> ActionClass {
        match self.domain() {
            Some(ActionDomain::Tree) | None => ActionClass::Tool,
            Some(domain) => ActionClass::ExternalRequest(ResourceClass::new(domain.as_str())),
        }
    }
}

impl From<String> for ActionId {
    fn from(value: String) -> Self {
        ActionId::parse(&value)
    }
}

impl From<&str> for ActionId {
    fn from(value: &str) -> Self {
        ActionId::parse(value)
    }
}

impl From<ActionId> for String {
    fn from(value: ActionId) -> Self {
        match value {
            ActionId::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
