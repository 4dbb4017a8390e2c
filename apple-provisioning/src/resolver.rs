// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pairing signing identities with provisioning profiles.
//!
//! Given a bundle identifier and the available signing identities, we look for
//! a provisioning profile that both covers the bundle identifier and authorizes
//! the identity's certificate.
//!
//! A profile covers a bundle identifier if its application identifier is the
//! profile's team prefix followed by the bundle identifier. If no profile
//! covers the bundle identifier exactly, the identifier is progressively
//! generalized into wildcard scopes. For `com.example.app` the scopes tried
//! are:
//!
//! 1. `com.example.app`
//! 2. `com.example.*`
//! 3. `com.*`
//! 4. `*`
//!
//! Identities are tried in catalog order and profiles are considered in
//! catalog order. The first match wins.

use {
    crate::{
        error::AppleProvisioningError, identity::SigningIdentity, platform::SigningCapabilities,
        profile::ProvisioningProfile,
    },
    log::{debug, info},
};

/// The scope matching any bundle identifier.
pub const WILDCARD_SCOPE: &str = "*";

/// Obtain the next more general scope of an application identifier scope.
///
/// Returns `None` if `scope` is already the universal wildcard.
pub fn generalize_scope(scope: &str) -> Option<String> {
    if scope == WILDCARD_SCOPE {
        return None;
    }

    if !scope.contains('.') {
        return Some(WILDCARD_SCOPE.to_string());
    }

    let mut tokens = scope.split('.').collect::<Vec<_>>();
    while tokens.last() == Some(&"") {
        tokens.pop();
    }

    let last = match tokens.len() {
        0 => return Some(WILDCARD_SCOPE.to_string()),
        len => len - 1,
    };

    let drop_index = if tokens[last] == WILDCARD_SCOPE {
        last.saturating_sub(1)
    } else {
        last
    };

    let stem = tokens[0..drop_index].join(".");

    Some(if stem.is_empty() {
        WILDCARD_SCOPE.to_string()
    } else {
        format!("{}.{}", stem, WILDCARD_SCOPE)
    })
}

/// Obtain every scope tried for a bundle identifier, most specific first.
pub fn scope_sequence(bundle_id: &str) -> Vec<String> {
    let mut scopes = vec![bundle_id.to_string()];

    while let Some(scope) = scopes.last().and_then(|scope| generalize_scope(scope)) {
        scopes.push(scope);
    }

    scopes
}

/// A signing identity paired with a provisioning profile authorizing it.
#[derive(Clone, Copy, Debug)]
pub struct Resolution<'a> {
    identity: &'a SigningIdentity,
    profile: &'a ProvisioningProfile,
    scope_index: usize,
}

impl<'a> Resolution<'a> {
    pub fn identity(&self) -> &'a SigningIdentity {
        self.identity
    }

    pub fn profile(&self) -> &'a ProvisioningProfile {
        self.profile
    }

    /// How many generalization steps were needed to find the profile.
    ///
    /// 0 means the bundle identifier matched exactly.
    pub fn generalization_depth(&self) -> usize {
        self.scope_index
    }
}

/// Resolves bundle identifiers against a set of valid provisioning profiles.
#[derive(Clone, Debug)]
pub struct ProfileResolver<'a> {
    profiles: Vec<&'a ProvisioningProfile>,
    capabilities: SigningCapabilities,
    required_profile: Option<String>,
}

impl<'a> ProfileResolver<'a> {
    /// Construct an instance over profiles in catalog order.
    ///
    /// Profiles should already be filtered for expiry.
    pub fn new(profiles: Vec<&'a ProvisioningProfile>, capabilities: SigningCapabilities) -> Self {
        Self {
            profiles,
            capabilities,
            required_profile: None,
        }
    }

    /// Require resolution to produce the profile having this name.
    pub fn set_required_profile(&mut self, name: Option<&str>) {
        self.required_profile = name.map(|s| s.to_string());
    }

    /// The scopes tried for a bundle identifier on this platform.
    pub fn scopes(&self, bundle_id: &str) -> Vec<String> {
        if self.capabilities.generalize_bundle_id {
            scope_sequence(bundle_id)
        } else {
            vec![bundle_id.to_string()]
        }
    }

    /// Find the first profile covering `bundle_id` that authorizes `identity`.
    pub fn match_bundle_id(
        &self,
        identity: &'a SigningIdentity,
        bundle_id: &str,
    ) -> Option<Resolution<'a>> {
        for (scope_index, scope) in self.scopes(bundle_id).into_iter().enumerate() {
            debug!(
                "looking for provisioning profile for {} with scope {}",
                identity.common_name(),
                scope
            );

            if let Some(profile) = self.profiles.iter().copied().find(|profile| {
                profile.matches_scope(&scope)
                    && profile.authorizes_certificate(identity.fingerprint())
            }) {
                return Some(Resolution {
                    identity,
                    profile,
                    scope_index,
                });
            }
        }

        info!(
            "no provisioning profile found matching signing identity {} and bundle id {}",
            identity.common_name(),
            bundle_id
        );

        None
    }

    /// Resolve a bundle identifier to an identity and profile.
    ///
    /// Identities are tried in order. The first identity having a matching
    /// profile wins. If a required profile is configured, resolutions producing
    /// other profiles are skipped.
    pub fn resolve(
        &self,
        bundle_id: &str,
        identities: &[&'a SigningIdentity],
    ) -> Result<Resolution<'a>, AppleProvisioningError> {
        if identities.is_empty() {
            return Err(AppleProvisioningError::NoSigningIdentity(
                self.capabilities.platform.as_str(),
            ));
        }

        debug!(
            "resolving {} against {} identities and {} profiles",
            bundle_id,
            identities.len(),
            self.profiles.len()
        );

        for identity in identities.iter().copied() {
            let resolution = match self.match_bundle_id(identity, bundle_id) {
                Some(resolution) => resolution,
                None => continue,
            };

            match &self.required_profile {
                Some(name) if name != resolution.profile.name() => {
                    debug!(
                        "ignoring provisioning profile {}; {} was requested",
                        resolution.profile.name(),
                        name
                    );
                }
                _ => {
                    info!(
                        "resolved {} to provisioning profile {} and identity {}",
                        bundle_id,
                        resolution.profile.name(),
                        resolution.identity
                    );
                    return Ok(resolution);
                }
            }
        }

        Err(match &self.required_profile {
            Some(name) => AppleProvisioningError::ProfileNotFound(name.clone()),
            None => AppleProvisioningError::NoMatchingProfile(bundle_id.to_string()),
        })
    }
}
