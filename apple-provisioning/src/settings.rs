// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing settings.
//!
//! [SigningSettings] holds everything a user can influence about how an
//! application is signed: which identity and provisioning profile to prefer,
//! what the signed product is for, and where intermediate files go. Settings
//! can be constructed programmatically or loaded from a JSON document, e.g.
//!
//! ```json
//! {
//!   "identity": "Apple Development: Jane Doe (ABCDE12345)",
//!   "provisioning-profile": "Example Development",
//!   "purpose": "development"
//! }
//! ```

use {
    crate::error::AppleProvisioningError,
    serde::Deserialize,
    std::path::{Path, PathBuf},
};

/// What a signed application is intended for.
///
/// This controls the `get-task-allow` entitlement, which permits debuggers to
/// attach to the process.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SigningPurpose {
    /// Running the application interactively, e.g. from a development machine.
    Development,
    /// Final distribution, e.g. to the App Store or via ad-hoc installs.
    Distribution,
}

impl SigningPurpose {
    /// The value of the `get-task-allow` entitlement for this purpose.
    pub fn task_allow(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl TryFrom<&str> for SigningPurpose {
    type Error = String;

    fn try_from(v: &str) -> Result<Self, Self::Error> {
        match v {
            "development" => Ok(Self::Development),
            "distribution" => Ok(Self::Distribution),
            _ => Err(format!(
                "{} is not a valid signing purpose; use development or distribution",
                v
            )),
        }
    }
}

/// Represents user-controllable settings for signing an application.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SigningSettings {
    identity: Option<String>,
    provisioning_profile: Option<String>,
    identity_user_name: Option<String>,
    identity_pattern: Option<String>,
    purpose: Option<SigningPurpose>,
    app_store: bool,
    verbose: bool,
    entitlements_template: Option<PathBuf>,
    work_directory: Option<PathBuf>,
    provisioning_profiles_directory: Option<PathBuf>,
}

impl SigningSettings {
    /// Parse settings from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, AppleProvisioningError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load settings from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AppleProvisioningError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;

        Self::from_json_str(&data).map_err(|e| {
            AppleProvisioningError::Settings(format!("{}: {}", path.display(), e))
        })
    }

    /// Exact common name of the signing identity to use.
    ///
    /// When set, identities are selected by name instead of by pattern.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn set_identity(&mut self, name: impl ToString) {
        self.identity = Some(name.to_string());
    }

    /// Name of the provisioning profile that resolution must produce.
    pub fn provisioning_profile(&self) -> Option<&str> {
        self.provisioning_profile.as_deref()
    }

    pub fn set_provisioning_profile(&mut self, name: impl ToString) {
        self.provisioning_profile = Some(name.to_string());
    }

    /// Substring pattern-matched identities must additionally contain.
    pub fn identity_user_name(&self) -> Option<&str> {
        self.identity_user_name.as_deref()
    }

    pub fn set_identity_user_name(&mut self, name: impl ToString) {
        self.identity_user_name = Some(name.to_string());
    }

    /// Regular expression overriding the platform's identity name pattern.
    pub fn identity_pattern(&self) -> Option<&str> {
        self.identity_pattern.as_deref()
    }

    pub fn set_identity_pattern(&mut self, pattern: impl ToString) {
        self.identity_pattern = Some(pattern.to_string());
    }

    /// The signing purpose.
    ///
    /// If not set, `get-task-allow` follows the resolved provisioning profile.
    pub fn purpose(&self) -> Option<SigningPurpose> {
        self.purpose
    }

    pub fn set_purpose(&mut self, purpose: SigningPurpose) {
        self.purpose = Some(purpose);
    }

    /// Whether the application is destined for the Mac App Store.
    pub fn app_store(&self) -> bool {
        self.app_store
    }

    pub fn set_app_store(&mut self, value: bool) {
        self.app_store = value;
    }

    /// Whether to pass `--verbose` to `codesign`.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn set_verbose(&mut self, value: bool) {
        self.verbose = value;
    }

    /// Entitlements plist used instead of the platform's default template.
    pub fn entitlements_template(&self) -> Option<&Path> {
        self.entitlements_template.as_deref()
    }

    pub fn set_entitlements_template(&mut self, path: impl Into<PathBuf>) {
        self.entitlements_template = Some(path.into());
    }

    /// Directory where the composed entitlements file is written.
    ///
    /// When unset, a temporary directory is used.
    pub fn work_directory(&self) -> Option<&Path> {
        self.work_directory.as_deref()
    }

    pub fn set_work_directory(&mut self, path: impl Into<PathBuf>) {
        self.work_directory = Some(path.into());
    }

    /// Directory scanned for provisioning profiles instead of the user's default.
    pub fn provisioning_profiles_directory(&self) -> Option<&Path> {
        self.provisioning_profiles_directory.as_deref()
    }

    pub fn set_provisioning_profiles_directory(&mut self, path: impl Into<PathBuf>) {
        self.provisioning_profiles_directory = Some(path.into());
    }
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    #[test]
    fn parse_json() -> Result<(), AppleProvisioningError> {
        let settings = SigningSettings::from_json_str(indoc! {r#"
            {
                "identity": "Apple Development: Jane Doe (ABCDE12345)",
                "provisioning-profile": "Example Development",
                "purpose": "distribution",
                "app-store": true,
                "work-directory": "/tmp/work"
            }
        "#})?;

        assert_eq!(
            settings.identity(),
            Some("Apple Development: Jane Doe (ABCDE12345)")
        );
        assert_eq!(settings.provisioning_profile(), Some("Example Development"));
        assert_eq!(settings.purpose(), Some(SigningPurpose::Distribution));
        assert!(settings.app_store());
        assert!(!settings.verbose());
        assert_eq!(settings.work_directory(), Some(Path::new("/tmp/work")));
        assert!(settings.entitlements_template().is_none());

        Ok(())
    }

    #[test]
    fn reject_unknown_keys() {
        assert!(SigningSettings::from_json_str(r#"{"identiy": "typo"}"#).is_err());
    }

    #[test]
    fn purpose_task_allow() {
        assert!(SigningPurpose::Development.task_allow());
        assert!(!SigningPurpose::Distribution.task_allow());
        assert_eq!(
            SigningPurpose::try_from("development"),
            Ok(SigningPurpose::Development)
        );
        assert!(SigningPurpose::try_from("release").is_err());
    }
}
