//! Authorization hook.
//!
//! Identity is established outside the scheduler; the core only asks an
//! [`AccessPolicy`] whether a known requester may act on a job.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::scheduler::Job;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl Requester {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_admin: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_admin: true,
        }
    }
}

pub trait AccessPolicy: Send + Sync {
    fn authorize_view(&self, requester: &Requester, job: &Job) -> Result<()>;

    fn authorize_cancel(&self, requester: &Requester, job: &Job) -> Result<()>;

    /// Submitter a listing must be restricted to, if any.
    fn listing_scope(&self, requester: &Requester) -> Option<String>;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authorize_view(&self, _requester: &Requester, _job: &Job) -> Result<()> {
        Ok(())
    }

    fn authorize_cancel(&self, _requester: &Requester, _job: &Job) -> Result<()> {
        Ok(())
    }

    fn listing_scope(&self, _requester: &Requester) -> Option<String> {
        None
    }
}

/// Admins see everything; everyone else only their own submissions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitterOrAdmin;

impl SubmitterOrAdmin {
    fn check(requester: &Requester, job: &Job, action: &str) -> Result<()> {
        if requester.is_admin || requester.id == job.submitted_by {
            Ok(())
        } else {
            Err(SchedulerError::Forbidden(format!(
                "{} may not {action} job {}",
                requester.id, job.id
            )))
        }
    }
}

impl AccessPolicy for SubmitterOrAdmin {
    fn authorize_view(&self, requester: &Requester, job: &Job) -> Result<()> {
        Self::check(requester, job, "view")
    }

    fn authorize_cancel(&self, requester: &Requester, job: &Job) -> Result<()> {
        Self::check(requester, job, "cancel")
    }

    fn listing_scope(&self, requester: &Requester) -> Option<String> {
        (!requester.is_admin).then(|| requester.id.clone())
    }
}
