// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end signing of application bundles and disk images.
//!
//! A [SigningSession] lives for the duration of one build. It discovers the
//! signing identities and provisioning profiles on first use and reuses them
//! for every subsequent operation, so signing an application and then its
//! extensions only queries the keychain and profile directory once.

use {
    crate::{
        entitlements::{EntitlementsComposer, EntitlementsFile},
        error::AppleProvisioningError,
        executor::SigningExecutor,
        identity::{IdentityCatalog, SigningIdentity},
        platform::{default_provisioning_profiles_directory, ApplePlatform, SigningCapabilities},
        profile::{ProvisioningProfile, ProvisioningProfileCatalog},
        resolver::{ProfileResolver, Resolution},
        settings::SigningSettings,
        tools::{SigningTools, ToolOutput},
    },
    apple_bundles::DirectoryBundle,
    log::{debug, error, info, warn},
    once_cell::unsync::OnceCell,
    std::path::{Path, PathBuf},
};

/// Environment variable telling `codesign` which `codesign_allocate` to use.
const CODESIGN_ALLOCATE_ENV: &str = "CODESIGN_ALLOCATE";

/// Prefix of identities able to sign software distributed outside the App Store.
const DEVELOPER_ID_APPLICATION: &str = "Developer ID Application";

/// Describes a successfully signed bundle.
#[derive(Clone, Debug)]
pub struct SignedBundle {
    /// Bundle identifier the signature was resolved for.
    pub bundle_id: String,

    /// Identity that produced the signature.
    pub identity: SigningIdentity,

    /// Provisioning profile embedded in the bundle, if any.
    pub profile: Option<ProvisioningProfile>,

    /// Output of the signature verification.
    pub verification: ToolOutput,
}

/// Signing operations sharing discovered identities and profiles.
pub struct SigningSession<T: SigningTools> {
    tools: T,
    capabilities: SigningCapabilities,
    settings: SigningSettings,
    identities: OnceCell<IdentityCatalog>,
    profiles: OnceCell<ProvisioningProfileCatalog>,
}

impl<T: SigningTools> SigningSession<T> {
    pub fn new(tools: T, capabilities: SigningCapabilities, settings: SigningSettings) -> Self {
        Self {
            tools,
            capabilities,
            settings,
            identities: OnceCell::new(),
            profiles: OnceCell::new(),
        }
    }

    pub fn tools(&self) -> &T {
        &self.tools
    }

    pub fn capabilities(&self) -> &SigningCapabilities {
        &self.capabilities
    }

    pub fn settings(&self) -> &SigningSettings {
        &self.settings
    }

    /// All signing identities in the keychain.
    pub fn identity_catalog(&self) -> &IdentityCatalog {
        self.identities
            .get_or_init(|| IdentityCatalog::load(&self.tools))
    }

    /// The directory provisioning profiles are loaded from.
    pub fn provisioning_profiles_directory(&self) -> Option<PathBuf> {
        self.settings
            .provisioning_profiles_directory()
            .map(|p| p.to_path_buf())
            .or_else(default_provisioning_profiles_directory)
    }

    /// All installed provisioning profiles for this platform, including expired ones.
    pub fn profile_catalog(&self) -> &ProvisioningProfileCatalog {
        self.profiles.get_or_init(|| {
            if let Some(dir) = self.provisioning_profiles_directory() {
                ProvisioningProfileCatalog::load_directory(dir, self.capabilities.profile_extension)
            } else {
                warn!("unable to resolve provisioning profiles directory");
                ProvisioningProfileCatalog::default()
            }
        })
    }

    /// Identities eligible for signing under the current settings.
    ///
    /// Errors if there are none.
    pub fn signing_identities(&self) -> Result<Vec<&SigningIdentity>, AppleProvisioningError> {
        let identities = self
            .identity_catalog()
            .select(&self.settings, &self.capabilities)?;

        if identities.is_empty() {
            Err(AppleProvisioningError::NoSigningIdentity(
                self.capabilities.platform.as_str(),
            ))
        } else {
            debug!("{} possible signing identities", identities.len());
            Ok(identities)
        }
    }

    /// Resolve a bundle identifier to a signing identity and provisioning profile.
    pub fn resolve(&self, bundle_id: &str) -> Result<Resolution<'_>, AppleProvisioningError> {
        let identities = self.signing_identities()?;

        let mut resolver = ProfileResolver::new(
            self.profile_catalog().valid_profiles(),
            self.capabilities.clone(),
        );
        resolver.set_required_profile(self.settings.provisioning_profile());

        resolver.resolve(bundle_id, &identities)
    }

    /// Determine the bundle identifier of a bundle.
    ///
    /// `explicit` takes precedence over the bundle's `Info.plist`.
    pub fn bundle_identifier(
        &self,
        bundle: &DirectoryBundle,
        explicit: Option<&str>,
    ) -> Result<String, AppleProvisioningError> {
        if let Some(id) = explicit {
            return Ok(id.to_string());
        }

        bundle
            .identifier()
            .map_err(AppleProvisioningError::DirectoryBundle)?
            .ok_or_else(|| AppleProvisioningError::BundleNoIdentifier(bundle.info_plist_path()))
    }

    /// Copy a provisioning profile into a bundle.
    ///
    /// Any previously embedded profile is removed first, even if `profile` is `None`.
    fn embed_profile(
        &self,
        bundle: &DirectoryBundle,
        profile: Option<&ProvisioningProfile>,
    ) -> Result<(), AppleProvisioningError> {
        let dest = bundle
            .root_dir()
            .join(self.capabilities.embedded_profile_path);

        if dest.exists() {
            debug!("removing stale provisioning profile {}", dest.display());
            std::fs::remove_file(&dest)?;
        }

        if let Some(profile) = profile {
            info!(
                "embedding provisioning profile {} at {}",
                profile.name(),
                dest.display()
            );
            std::fs::copy(profile.path(), &dest)?;
        }

        Ok(())
    }

    /// Obtain the entitlements for signing.
    ///
    /// iOS entitlements are always composed from the resolved profile. macOS
    /// entitlements are only composed for App Store builds; otherwise the
    /// configured entitlements file is used as-is.
    fn entitlements(
        &self,
        resolution: Option<&Resolution>,
        bundle_id: &str,
    ) -> Result<Option<EntitlementsFile>, AppleProvisioningError> {
        let document = match (self.capabilities.platform, resolution) {
            (ApplePlatform::Ios, Some(resolution)) => {
                let profile = resolution.profile();
                let task_allow = self
                    .settings
                    .purpose()
                    .map(|purpose| purpose.task_allow())
                    .unwrap_or_else(|| profile.task_allow());

                EntitlementsComposer::from_settings(&self.settings, &self.capabilities)?.compose(
                    profile,
                    profile.app_identifier_prefix().unwrap_or_default(),
                    bundle_id,
                    task_allow,
                )
            }
            (ApplePlatform::MacOs, resolution) if self.settings.app_store() => {
                EntitlementsComposer::from_settings(&self.settings, &self.capabilities)?
                    .merge(resolution.map(|r| r.profile()))
            }
            _ => {
                return Ok(self
                    .settings
                    .entitlements_template()
                    .map(EntitlementsFile::existing))
            }
        };

        debug!("entitlements: {:?}", document);

        Ok(Some(EntitlementsFile::write(
            &document,
            self.settings.work_directory(),
        )?))
    }

    fn executor(&self) -> SigningExecutor<'_, T> {
        let mut executor = SigningExecutor::new(&self.tools, self.capabilities.clone());
        executor.set_verbose(self.settings.verbose());

        if let Some(sdk) = self.capabilities.codesign_allocate_sdk {
            match self.tools.sdk_tool(sdk, "codesign_allocate") {
                Ok(output) if output.success() => {
                    executor.set_environment(CODESIGN_ALLOCATE_ENV, output.output.trim());
                }
                Ok(output) => {
                    warn!("unable to locate codesign_allocate for {}: {}", sdk, output.status);
                }
                Err(e) => {
                    warn!("unable to locate codesign_allocate for {}: {}", sdk, e);
                }
            }
        }

        executor
    }

    /// Sign an application bundle.
    ///
    /// The bundle identifier is read from the bundle's `Info.plist` unless
    /// `bundle_id` is given. A provisioning profile is resolved and embedded,
    /// entitlements are composed, and the bundle is signed and verified.
    pub fn sign_app(
        &self,
        app_path: &Path,
        bundle_id: Option<&str>,
    ) -> Result<SignedBundle, AppleProvisioningError> {
        let bundle =
            DirectoryBundle::new_from_path(app_path).map_err(AppleProvisioningError::DirectoryBundle)?;
        let bundle_id = self.bundle_identifier(&bundle, bundle_id)?;
        info!("signing {} with bundle id {}", app_path.display(), bundle_id);

        let identities = self.signing_identities()?;

        let resolution = match self.resolve(&bundle_id) {
            Ok(resolution) => Some(resolution),
            Err(e) if self.capabilities.profile_required => return Err(e),
            Err(e) => {
                if self.settings.app_store() {
                    error!("{}; the application can't be submitted to TestFlight", e);
                } else {
                    debug!("{}", e);
                }
                None
            }
        };

        let identity = resolution
            .as_ref()
            .map(|r| r.identity())
            .unwrap_or(identities[0]);
        let profile = resolution.as_ref().map(|r| r.profile());

        self.embed_profile(&bundle, profile)?;
        let entitlements = self.entitlements(resolution.as_ref(), &bundle_id)?;

        let inner_targets = if self.capabilities.sign_main_executable {
            let executable = bundle
                .main_executable()
                .map_err(AppleProvisioningError::DirectoryBundle)?
                .ok_or_else(|| {
                    AppleProvisioningError::BundleNoMainExecutable(bundle.info_plist_path())
                })?;

            vec![bundle.resolve_path("MacOS").join(executable)]
        } else {
            vec![]
        };

        let verification = self.executor().sign_and_verify(
            identity,
            entitlements.as_ref().map(|e| e.path()),
            bundle.root_dir(),
            &inner_targets,
        )?;

        Ok(SignedBundle {
            bundle_id,
            identity: identity.clone(),
            profile: profile.cloned(),
            verification,
        })
    }

    /// Sign a disk image.
    ///
    /// A `Developer ID Application` identity is preferred, since only those
    /// can be notarized.
    pub fn sign_disk_image(&self, dmg_path: &Path) -> Result<ToolOutput, AppleProvisioningError> {
        let identities = self.signing_identities()?;

        let identity = identities
            .iter()
            .copied()
            .find(|identity| identity.common_name().starts_with(DEVELOPER_ID_APPLICATION))
            .unwrap_or(identities[0]);
        info!("signing disk image {} with identity {}", dmg_path.display(), identity);

        let entitlements = self.entitlements(None, "")?;

        self.executor().sign_and_verify(
            identity,
            entitlements.as_ref().map(|e| e.path()),
            dmg_path,
            &[],
        )
    }

    /// Verify the signature of a path.
    pub fn verify(&self, path: &Path) -> Result<ToolOutput, AppleProvisioningError> {
        SigningExecutor::new(&self.tools, self.capabilities.clone()).verify(path)
    }
}
