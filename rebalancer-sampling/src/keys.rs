//! Keys of rebalanced rates in the shared cache.

use std::fmt;

use rebalancer_common::{OrganizationId, ProjectId};

/// The hash holding rebalanced rates of all projects in an organization.
///
/// Every field of the hash is a project id, the value is that project's sample rate.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProjectRatesKey(String);

impl ProjectRatesKey {
    /// Creates the key for the given organization.
    pub fn new(org_id: OrganizationId) -> Self {
        Self(format!("ds::o:{org_id}:prioritise_projects"))
    }

    /// Returns the hash field of a project.
    pub fn field(project_id: ProjectId) -> String {
        project_id.to_string()
    }

    /// Returns the key as string.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ProjectRatesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The hash holding rebalanced transaction rates of a single project.
///
/// Explicitly priced names are stored under `n:{name}`, the rate of all other names under
/// [`DEFAULT_FIELD`](Self::DEFAULT_FIELD).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransactionRatesKey(String);

impl TransactionRatesKey {
    /// The hash field of the default rate.
    pub const DEFAULT_FIELD: &'static str = "default";

    const NAME_PREFIX: &'static str = "n:";

    /// Creates the key for the given project.
    pub fn new(org_id: OrganizationId, project_id: ProjectId) -> Self {
        Self(format!(
            "ds::o:{org_id}:p:{project_id}:prioritise_transactions"
        ))
    }

    /// Returns the hash field of an explicitly priced transaction name.
    pub fn name_field(transaction_name: &str) -> String {
        format!("{}{transaction_name}", Self::NAME_PREFIX)
    }

    /// Returns the transaction name stored in a hash field, if it is not the default field.
    pub fn parse_field(field: &str) -> Option<&str> {
        field.strip_prefix(Self::NAME_PREFIX)
    }

    /// Returns the key as string.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for TransactionRatesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
