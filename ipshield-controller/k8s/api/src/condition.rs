use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// The closed set of condition types the controller publishes on a
/// RouteAllowlist status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConditionType {
    /// Transient: a reconcile pass is in progress.
    Reconciling,
    /// The allowlist has been applied to every selected route.
    Admitted,
    /// The selector matched no routes; nothing to do.
    NoRoutesFound,
    /// The spec's label selector cannot be evaluated.
    SelectorInvalid,
    RouteFetchError,
    RouteUpdateFailure,
    RouteDeleteFailure,
    LedgerFetchFailure,
    LedgerUpdateFailure,
    /// Cleanup completed and the finalizer was removed.
    Deleted,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    ReconcileSuccessful,
    ReconcileError,
    ReconcileWarning,
    ProcessingAllowlist,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reconciling => "AllowlistReconciling",
            Self::Admitted => "Admitted",
            Self::NoRoutesFound => "NoRoutesFound",
            Self::SelectorInvalid => "SelectorInvalid",
            Self::RouteFetchError => "RouteFetchError",
            Self::RouteUpdateFailure => "RouteUpdateFailure",
            Self::RouteDeleteFailure => "RouteDeleteFailure",
            Self::LedgerFetchFailure => "ConfigMapFetchFailure",
            Self::LedgerUpdateFailure => "ConfigMapUpdateFailure",
            Self::Deleted => "Deleted",
        }
    }

    /// Conditions that describe a pass in flight rather than an outcome; these
    /// are stripped at the start of each reconcile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Reconciling | Self::NoRoutesFound)
    }

    pub fn all() -> impl Iterator<Item = ConditionType> {
        [
            Self::Reconciling,
            Self::Admitted,
            Self::NoRoutesFound,
            Self::SelectorInvalid,
            Self::RouteFetchError,
            Self::RouteUpdateFailure,
            Self::RouteDeleteFailure,
            Self::LedgerFetchFailure,
            Self::LedgerUpdateFailure,
            Self::Deleted,
        ]
        .into_iter()
    }
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReconcileSuccessful => "ReconcileSuccessful",
            Self::ReconcileError => "ReconcileError",
            Self::ReconcileWarning => "ReconcileWarning",
            Self::ProcessingAllowlist => "ProcessingAllowlist",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upserts a condition keyed by type. The transition timestamp is only
/// refreshed when the status value actually flips.
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: bool,
    reason: Reason,
    message: impl ToString,
) {
    let status = if status { "True" } else { "False" };
    let next = Condition {
        last_transition_time: Time(Utc::now()),
        message: message.to_string(),
        observed_generation: None,
        reason: reason.as_str().to_string(),
        status: status.to_string(),
        type_: type_.as_str().to_string(),
    };

    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(existing) => {
            if existing.status == next.status {
                existing.reason = next.reason;
                existing.message = next.message;
            } else {
                *existing = next;
            }
        }
        None => conditions.push(next),
    }
}

pub fn remove(conditions: &mut Vec<Condition>, type_: ConditionType) {
    conditions.retain(|c| c.type_ != type_.as_str());
}

pub fn get<'c>(conditions: &'c [Condition], type_: ConditionType) -> Option<&'c Condition> {
    conditions.iter().find(|c| c.type_ == type_.as_str())
}

pub fn success(conditions: &mut Vec<Condition>, type_: ConditionType) {
    set(
        conditions,
        type_,
        true,
        Reason::ReconcileSuccessful,
        "Reconciliation successful",
    );
}

pub fn failed(conditions: &mut Vec<Condition>, type_: ConditionType, error: &dyn std::fmt::Display) {
    set(
        conditions,
        type_,
        false,
        Reason::ReconcileError,
        format!("failed due to error {}", error),
    );
}

pub fn warning(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    error: &dyn std::fmt::Display,
) {
    set(
        conditions,
        type_,
        false,
        Reason::ReconcileWarning,
        format!("an error occurred {}", error),
    );
}
