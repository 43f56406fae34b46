use super::generate_branch;
use crate::BaseHeaders;
use bytesstr::BytesStr;
use sip_types::msg::MessageLine;
use sip_types::Method;
use std::fmt;

/// Which side of the transaction this endpoint is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxRole {
    Client,
    Server,
}

/// Unique transaction key: (branch, method, role).
///
/// ACK requests map onto the INVITE method so a non-2xx ACK is routed into
/// the INVITE server transaction waiting for it; the ACK for a 2xx carries a
/// fresh branch and never matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxKey {
    branch: BytesStr,
    method: Method,
    role: TxRole,
}

#[derive(Debug, thiserror::Error)]
pub enum TxKeyError {
    #[error("topmost Via has no RFC 3261 branch parameter")]
    MissingBranch,
}

impl TxKey {
    /// Key for a new client transaction with a freshly generated branch
    pub(crate) fn client(method: Method) -> Self {
        Self {
            branch: generate_branch(),
            method: normalize_method(method),
            role: TxRole::Client,
        }
    }

    /// Key for the CANCEL transaction belonging to this INVITE client key
    pub(crate) fn cancel_of(&self) -> Self {
        Self {
            branch: self.branch.clone(),
            method: Method::CANCEL,
            role: TxRole::Client,
        }
    }

    /// Derive the key a received message belongs to
    pub fn from_message_parts(
        line: &MessageLine,
        base_headers: &BaseHeaders,
    ) -> Result<Self, TxKeyError> {
        let via = &base_headers.via[0];

        let branch = via
            .branch()
            .filter(|branch| branch.starts_with(super::RFC3261_BRANCH_PREFIX))
            .ok_or(TxKeyError::MissingBranch)?
            .clone();

        let role = if line.is_request() {
            TxRole::Server
        } else {
            TxRole::Client
        };

        Ok(Self {
            branch,
            method: normalize_method(base_headers.cseq.method.clone()),
            role,
        })
    }

    pub fn branch(&self) -> &BytesStr {
        &self.branch
    }
}

fn normalize_method(method: Method) -> Method {
    if method == Method::ACK {
        Method::INVITE
    } else {
        method
    }
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}:{}", self.role, self.method, self.branch)
    }
}
