//! Quota prompt and low-resource boundaries

use serde::{Deserialize, Serialize};
use std::fmt;
use webstore_policy::{Quota, StorageClass};

/// Identifies a window the prompt can be shown in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromptTarget(pub u64);

/// Everything a prompt needs to ask the user for more space.
#[derive(Debug, Clone)]
pub struct QuotaRequest {
    pub id: u64,
    pub display_name: String,
    pub domain: String,
    pub origin: String,
    pub class: StorageClass,
    pub current_quota: Quota,
    /// Bytes the origin uses right now.
    pub current_size: u64,
    /// Bytes the origin would need for the suspended write to fit.
    pub desired_size: u64,
    pub target: Option<PromptTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaReply {
    /// Raise the origin quota to this many bytes.
    AllowUpTo(u64),
    /// Stop enforcing quota for the origin.
    AllowUnbounded,
    /// Refuse; later writes over quota fail without asking.
    Deny { new_quota: Option<u64> },
}

type ReplyFn = Box<dyn FnOnce(Option<QuotaReply>) + Send>;

/// One-shot answer channel for a quota request. Dropping it unanswered
/// counts as a cancel.
pub struct QuotaResponder {
    request_id: u64,
    reply_to: Option<ReplyFn>,
}

impl QuotaResponder {
    pub(crate) fn new(request_id: u64, reply_to: ReplyFn) -> Self {
        Self {
            request_id,
            reply_to: Some(reply_to),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn reply(mut self, reply: QuotaReply) {
        if let Some(reply_to) = self.reply_to.take() {
            reply_to(Some(reply));
        }
    }

    pub fn cancel(mut self) {
        if let Some(reply_to) = self.reply_to.take() {
            reply_to(None);
        }
    }
}

impl Drop for QuotaResponder {
    fn drop(&mut self) {
        if let Some(reply_to) = self.reply_to.take() {
            reply_to(None);
        }
    }
}

impl fmt::Debug for QuotaResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaResponder")
            .field("request_id", &self.request_id)
            .field("answered", &self.reply_to.is_none())
            .finish()
    }
}

/// UI side of quota handling. Implementations show a prompt and answer
/// through the responder, now or later.
pub trait QuotaPrompt: Send + Sync {
    fn request_quota_increase(&self, request: QuotaRequest, responder: QuotaResponder);

    /// The request is no longer relevant; any pending reply is ignored.
    fn cancel(&self, request_id: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LowResourceKind {
    NoMemory,
    SoftNoMemory,
    NoDisk,
}

impl fmt::Display for LowResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LowResourceKind::NoMemory => "out of memory",
            LowResourceKind::SoftNoMemory => "out of memory (soft)",
            LowResourceKind::NoDisk => "out of disk",
        })
    }
}

/// Process-wide sink for fatal resource shortages.
pub trait LowResourceHandler: Send + Sync {
    fn raise(&self, kind: LowResourceKind);
}

/// Default handler: logs and carries on.
#[derive(Debug, Default)]
pub struct LogLowResource;

impl LowResourceHandler for LogLowResource {
    fn raise(&self, kind: LowResourceKind) {
        tracing::error!(kind = %kind, "Low resource condition");
    }
}
