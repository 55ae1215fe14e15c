// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-identity
#![deny(unsafe_code)]
//!
//! Durable links between channel principals and operator identities.
//!
//! A principal is the triple `(channel, tenant, actor)`; at most one *active*
//! binding exists per principal at any replay point. Bindings carry an
//! assurance tier (defaulted from the channel, overridable at link time) and
//! the scopes the operator granted.

use mu_core::envelope::{AssuranceTier, Channel};
use mu_journal::{JournalError, JsonlJournal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// Lifecycle status of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingStatus {
    /// Live and usable for identity resolution.
    Active,
    /// Unlinked by the operator; kept for audit.
    Unlinked,
    /// Revoked by an admin; kept for audit.
    Revoked,
}

/// A durable channel-principal ↔ operator link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityBinding {
    /// Unique binding id.
    pub binding_id: String,
    /// Operator this principal maps to.
    pub operator_id: String,
    /// Source channel.
    pub channel: Channel,
    /// Channel tenant id.
    pub channel_tenant_id: String,
    /// Channel actor id.
    pub channel_actor_id: String,
    /// Assurance tier in effect for this binding.
    pub assurance_tier: AssuranceTier,
    /// Scopes granted to this binding.
    pub scopes: Vec<String>,
    /// Current status.
    pub status: BindingStatus,
    /// Link time, milliseconds since epoch.
    pub created_at_ms: u64,
    /// Last status change.
    pub updated_at_ms: u64,
    /// Binding id of the revoker, for revoked bindings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<String>,
    /// Human-readable unlink/revoke reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

impl IdentityBinding {
    fn principal_key(&self) -> PrincipalKey {
        PrincipalKey {
            channel: self.channel,
            tenant: self.channel_tenant_id.clone(),
            actor: self.channel_actor_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PrincipalKey {
    channel: Channel,
    tenant: String,
    actor: String,
}

/// Journal rows for the identity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum IdentityEntry {
    /// A new binding was created.
    Link {
        /// The binding as linked.
        binding: IdentityBinding,
    },
    /// A binding was unlinked by its operator.
    Unlink {
        /// Binding id.
        binding_id: String,
        /// When.
        at_ms: u64,
        /// Optional reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A binding was revoked by an admin.
    Revoke {
        /// Binding id.
        binding_id: String,
        /// When.
        at_ms: u64,
        /// Who revoked it.
        revoked_by: String,
        /// Optional reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Errors from identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Underlying journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// The principal already has an active binding.
    #[error("principal already linked via binding {existing_binding_id}")]
    PrincipalAlreadyLinked {
        /// The currently active binding id.
        existing_binding_id: String,
    },

    /// The binding id is unknown.
    #[error("unknown binding {0}")]
    UnknownBinding(String),

    /// The binding is not active.
    #[error("binding {0} is not active")]
    NotActive(String),
}

/// The identity store: journal plus in-memory indexes.
#[derive(Debug)]
pub struct IdentityStore {
    journal: JsonlJournal,
    by_id: HashMap<String, IdentityBinding>,
    active_by_principal: HashMap<PrincipalKey, String>,
}

impl IdentityStore {
    /// Open (and replay) the identity journal at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IdentityError> {
        let journal = JsonlJournal::new(path);
        let rows: Vec<IdentityEntry> = journal.load()?;
        let mut this = Self {
            journal,
            by_id: HashMap::new(),
            active_by_principal: HashMap::new(),
        };
        for row in rows {
            this.apply(row);
        }
        Ok(this)
    }

    fn apply(&mut self, entry: IdentityEntry) {
        match entry {
            IdentityEntry::Link { binding } => {
                self.active_by_principal
                    .insert(binding.principal_key(), binding.binding_id.clone());
                self.by_id.insert(binding.binding_id.clone(), binding);
            }
            IdentityEntry::Unlink {
                binding_id,
                at_ms,
                reason,
            } => {
                if let Some(binding) = self.by_id.get_mut(&binding_id) {
                    binding.status = BindingStatus::Unlinked;
                    binding.updated_at_ms = at_ms;
                    binding.status_reason = reason;
                    self.active_by_principal.remove(&binding.principal_key());
                }
            }
            IdentityEntry::Revoke {
                binding_id,
                at_ms,
                revoked_by,
                reason,
            } => {
                if let Some(binding) = self.by_id.get_mut(&binding_id) {
                    binding.status = BindingStatus::Revoked;
                    binding.updated_at_ms = at_ms;
                    binding.revoked_by = Some(revoked_by);
                    binding.status_reason = reason;
                    self.active_by_principal.remove(&binding.principal_key());
                }
            }
        }
    }

    /// Link a principal to an operator.
    ///
    /// `tier` overrides the channel default when given.
    #[allow(clippy::too_many_arguments)]
    pub fn link(
        &mut self,
        binding_id: impl Into<String>,
        operator_id: impl Into<String>,
        channel: Channel,
        tenant: impl Into<String>,
        actor: impl Into<String>,
        scopes: Vec<String>,
        tier: Option<AssuranceTier>,
        now_ms: u64,
    ) -> Result<IdentityBinding, IdentityError> {
        let tenant = tenant.into();
        let actor = actor.into();
        let key = PrincipalKey {
            channel,
            tenant: tenant.clone(),
            actor: actor.clone(),
        };
        if let Some(existing) = self.active_by_principal.get(&key) {
            return Err(IdentityError::PrincipalAlreadyLinked {
                existing_binding_id: existing.clone(),
            });
        }

        let binding = IdentityBinding {
            binding_id: binding_id.into(),
            operator_id: operator_id.into(),
            channel,
            channel_tenant_id: tenant,
            channel_actor_id: actor,
            assurance_tier: tier.unwrap_or_else(|| channel.default_tier()),
            scopes,
            status: BindingStatus::Active,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            revoked_by: None,
            status_reason: None,
        };
        self.journal.append(&IdentityEntry::Link {
            binding: binding.clone(),
        })?;
        info!(
            target: "mu.identity",
            binding_id = %binding.binding_id,
            channel = %binding.channel,
            tier = %binding.assurance_tier,
            "principal linked"
        );
        self.apply(IdentityEntry::Link {
            binding: binding.clone(),
        });
        Ok(binding)
    }

    /// Unlink an active binding.
    pub fn unlink(
        &mut self,
        binding_id: &str,
        reason: Option<String>,
        now_ms: u64,
    ) -> Result<(), IdentityError> {
        self.require_active(binding_id)?;
        let entry = IdentityEntry::Unlink {
            binding_id: binding_id.to_string(),
            at_ms: now_ms,
            reason,
        };
        self.journal.append(&entry)?;
        self.apply(entry);
        Ok(())
    }

    /// Revoke an active binding.
    pub fn revoke(
        &mut self,
        binding_id: &str,
        revoked_by: impl Into<String>,
        reason: Option<String>,
        now_ms: u64,
    ) -> Result<(), IdentityError> {
        self.require_active(binding_id)?;
        let entry = IdentityEntry::Revoke {
            binding_id: binding_id.to_string(),
            at_ms: now_ms,
            revoked_by: revoked_by.into(),
            reason,
        };
        self.journal.append(&entry)?;
        self.apply(entry);
        Ok(())
    }

    fn require_active(&self, binding_id: &str) -> Result<(), IdentityError> {
        let binding = self
            .by_id
            .get(binding_id)
            .ok_or_else(|| IdentityError::UnknownBinding(binding_id.to_string()))?;
        if binding.status != BindingStatus::Active {
            return Err(IdentityError::NotActive(binding_id.to_string()));
        }
        Ok(())
    }

    /// Resolve the active binding for a principal.
    pub fn resolve(&self, channel: Channel, tenant: &str, actor: &str) -> Option<&IdentityBinding> {
        let key = PrincipalKey {
            channel,
            tenant: tenant.to_string(),
            actor: actor.to_string(),
        };
        self.active_by_principal
            .get(&key)
            .and_then(|id| self.by_id.get(id))
    }

    /// Fetch any binding by id (active or not).
    pub fn get(&self, binding_id: &str) -> Option<&IdentityBinding> {
        self.by_id.get(binding_id)
    }

    /// Count of active bindings.
    pub fn active_len(&self) -> usize {
        self.active_by_principal.len()
    }
}
