// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Composing the entitlements embedded in a signature.
//!
//! The entitlements document starts from a template. Keys granted by the
//! provisioning profile are copied in unless the template already defines
//! them. Finally the application identifier and `get-task-allow` are bound to
//! the application being signed.

use {
    crate::{
        error::AppleProvisioningError,
        platform::SigningCapabilities,
        profile::{ProvisioningProfile, ENTITLEMENT_APPLICATION_IDENTIFIER, ENTITLEMENT_GET_TASK_ALLOW},
        settings::SigningSettings,
    },
    log::debug,
    plist::{Dictionary, Value},
    std::path::{Path, PathBuf},
};

/// File name of the entitlements document handed to `codesign`.
pub const ENTITLEMENTS_FILE_NAME: &str = "Entitlements.plist";

fn dictionary_from_value(
    value: Value,
    source: impl std::fmt::Display,
) -> Result<Dictionary, AppleProvisioningError> {
    value
        .into_dictionary()
        .ok_or_else(|| AppleProvisioningError::EntitlementsNotDictionary(source.to_string()))
}

/// Builds entitlements documents from a template.
#[derive(Clone, Debug)]
pub struct EntitlementsComposer {
    template: Dictionary,
    implied: Vec<String>,
}

impl EntitlementsComposer {
    /// Construct an instance from a template dictionary.
    pub fn new(template: Dictionary) -> Self {
        Self {
            template,
            implied: vec![],
        }
    }

    /// Construct an instance from XML plist template data.
    pub fn from_xml(data: &[u8]) -> Result<Self, AppleProvisioningError> {
        let value = Value::from_reader_xml(data)?;

        Ok(Self::new(dictionary_from_value(value, "built-in template")?))
    }

    /// Construct an instance from a plist file (XML or binary).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AppleProvisioningError> {
        let path = path.as_ref();
        let value = Value::from_file(path)?;

        Ok(Self::new(dictionary_from_value(value, path.display())?))
    }

    /// Construct the composer for a platform.
    ///
    /// The template from settings is used if configured. Otherwise the
    /// platform's built-in template is used.
    pub fn from_settings(
        settings: &SigningSettings,
        capabilities: &SigningCapabilities,
    ) -> Result<Self, AppleProvisioningError> {
        let composer = if let Some(path) = settings.entitlements_template() {
            debug!("using entitlements template {}", path.display());
            Self::from_path(path)?
        } else {
            Self::from_xml(capabilities.default_entitlements.as_bytes())?
        };

        Ok(composer.with_implied_entitlements(capabilities.implied_entitlements))
    }

    /// Define boolean entitlements set to `true` unless the template defines them.
    pub fn with_implied_entitlements(mut self, keys: &[&str]) -> Self {
        self.implied = keys.iter().map(|key| key.to_string()).collect();
        self
    }

    /// The template documents start from.
    pub fn template(&self) -> &Dictionary {
        &self.template
    }

    /// Merge the template, implied entitlements, and profile entitlements.
    ///
    /// Existing keys are never overwritten.
    pub fn merge(&self, profile: Option<&ProvisioningProfile>) -> Dictionary {
        let mut document = self.template.clone();

        for key in &self.implied {
            if !document.contains_key(key) {
                document.insert(key.clone(), Value::Boolean(true));
            }
        }

        if let Some(profile) = profile {
            for (key, value) in profile.entitlements() {
                if !document.contains_key(key) {
                    document.insert(key.clone(), value.clone());
                }
            }
        }

        document
    }

    /// Compose the entitlements for signing `bundle_id` with `profile`.
    ///
    /// `application-identifier` and `get-task-allow` are always set.
    pub fn compose(
        &self,
        profile: &ProvisioningProfile,
        app_identifier_prefix: &str,
        bundle_id: &str,
        task_allow: bool,
    ) -> Dictionary {
        let mut document = self.merge(Some(profile));

        document.insert(
            ENTITLEMENT_APPLICATION_IDENTIFIER.to_string(),
            Value::String(format!("{}.{}", app_identifier_prefix, bundle_id)),
        );
        document.insert(
            ENTITLEMENT_GET_TASK_ALLOW.to_string(),
            Value::Boolean(task_allow),
        );

        document
    }
}

/// An entitlements plist written to disk.
///
/// When backed by a temporary directory, the file is deleted on drop.
#[derive(Debug)]
pub struct EntitlementsFile {
    path: PathBuf,
    _temp_dir: Option<tempfile::TempDir>,
}

impl EntitlementsFile {
    /// Write an entitlements document as an XML plist.
    ///
    /// The file is written to `work_directory` if given, otherwise to a new
    /// temporary directory.
    pub fn write(
        document: &Dictionary,
        work_directory: Option<&Path>,
    ) -> Result<Self, AppleProvisioningError> {
        let (directory, temp_dir) = match work_directory {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.to_path_buf(), None)
            }
            None => {
                let temp_dir = tempfile::Builder::new()
                    .prefix("apple-provisioning-")
                    .tempdir()?;
                (temp_dir.path().to_path_buf(), Some(temp_dir))
            }
        };

        let path = directory.join(ENTITLEMENTS_FILE_NAME);
        debug!("writing entitlements to {}", path.display());
        Value::Dictionary(document.clone()).to_file_xml(&path)?;

        Ok(Self {
            path,
            _temp_dir: temp_dir,
        })
    }

    /// Reference an existing entitlements file without taking ownership of it.
    pub fn existing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _temp_dir: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::{date, profile_with_scope},
        indoc::indoc,
    };

    fn profile_entitlements() -> ProvisioningProfile {
        let profile = profile_with_scope("P", "TEAM1", "com.example.*", &["F1"], date(2099, 1, 1));

        let mut entitlements = profile.entitlements().clone();
        entitlements.insert(
            "aps-environment".to_string(),
            Value::String("production".into()),
        );
        entitlements.insert(
            "keychain-access-groups".to_string(),
            Value::Array(vec![Value::String("TEAM1.*".into())]),
        );
        entitlements.insert(ENTITLEMENT_GET_TASK_ALLOW.to_string(), Value::Boolean(true));

        ProvisioningProfile::new(
            profile.path(),
            profile.name(),
            Some("TEAM1".into()),
            entitlements,
            profile.expiration_date(),
        )
        .with_developer_certificate_fingerprints(["F1"])
    }

    #[test]
    fn profile_never_overrides_template() -> Result<(), AppleProvisioningError> {
        let composer = EntitlementsComposer::from_xml(
            indoc! {r#"
                <?xml version="1.0" encoding="UTF-8"?>
                <plist version="1.0">
                <dict>
                    <key>aps-environment</key>
                    <string>development</string>
                </dict>
                </plist>
            "#}
            .as_bytes(),
        )?;

        let document = composer.compose(&profile_entitlements(), "TEAM1", "com.example.app", false);

        assert_eq!(
            document.get("aps-environment").and_then(Value::as_string),
            Some("development")
        );
        assert!(document.contains_key("keychain-access-groups"));
        assert_eq!(
            document
                .get(ENTITLEMENT_APPLICATION_IDENTIFIER)
                .and_then(Value::as_string),
            Some("TEAM1.com.example.app")
        );
        // The requested flag wins over both template and profile.
        assert_eq!(
            document
                .get(ENTITLEMENT_GET_TASK_ALLOW)
                .and_then(Value::as_boolean),
            Some(false)
        );

        Ok(())
    }

    #[test]
    fn identity_binding_with_empty_template() {
        let composer = EntitlementsComposer::new(Dictionary::new());
        let profile = profile_with_scope("P", "TEAM1", "*", &["F1"], date(2099, 1, 1));

        let document = composer.compose(&profile, "TEAM1", "org.example.app", true);
        assert_eq!(
            document
                .get(ENTITLEMENT_APPLICATION_IDENTIFIER)
                .and_then(Value::as_string),
            Some("TEAM1.org.example.app")
        );
        assert_eq!(
            document
                .get(ENTITLEMENT_GET_TASK_ALLOW)
                .and_then(Value::as_boolean),
            Some(true)
        );
    }

    #[test]
    fn implied_entitlements() -> Result<(), AppleProvisioningError> {
        let composer = EntitlementsComposer::from_settings(
            &SigningSettings::default(),
            &SigningCapabilities::macos(),
        )?;
        let document = composer.merge(None);

        for key in SigningCapabilities::macos().implied_entitlements {
            assert_eq!(
                document.get(key).and_then(Value::as_boolean),
                Some(true),
                "{}",
                key
            );
        }
        assert!(document.contains_key("com.apple.security.network.client"));
        assert!(!document.contains_key(ENTITLEMENT_APPLICATION_IDENTIFIER));

        let mut template = Dictionary::new();
        template.insert(
            "com.apple.security.app-sandbox".to_string(),
            Value::Boolean(false),
        );
        let document = EntitlementsComposer::new(template)
            .with_implied_entitlements(&["com.apple.security.app-sandbox"])
            .merge(None);
        assert_eq!(
            document
                .get("com.apple.security.app-sandbox")
                .and_then(Value::as_boolean),
            Some(false)
        );

        Ok(())
    }

    #[test]
    fn template_from_settings() -> Result<(), AppleProvisioningError> {
        let temp_dir = tempfile::tempdir()?;
        let template_path = temp_dir.path().join("custom.plist");

        let mut template = Dictionary::new();
        template.insert(
            "com.apple.developer.associated-domains".to_string(),
            Value::Array(vec![Value::String("applinks:example.com".into())]),
        );
        Value::Dictionary(template).to_file_binary(&template_path)?;

        let mut settings = SigningSettings::default();
        settings.set_entitlements_template(&template_path);
        let composer = EntitlementsComposer::from_settings(&settings, &SigningCapabilities::ios())?;
        assert!(composer
            .template()
            .contains_key("com.apple.developer.associated-domains"));
        assert!(!composer.template().contains_key(ENTITLEMENT_GET_TASK_ALLOW));

        std::fs::write(&template_path, b"<plist version=\"1.0\"><string>x</string></plist>")?;
        assert!(matches!(
            EntitlementsComposer::from_settings(&settings, &SigningCapabilities::ios()),
            Err(AppleProvisioningError::EntitlementsNotDictionary(_))
        ));

        Ok(())
    }

    #[test]
    fn write_file() -> Result<(), AppleProvisioningError> {
        let composer = EntitlementsComposer::from_xml(SigningCapabilities::ios().default_entitlements.as_bytes())?;
        let document = composer.compose(&profile_entitlements(), "TEAM1", "com.example.app", true);

        let temp_path = {
            let file = EntitlementsFile::write(&document, None)?;
            assert!(file.path().ends_with(ENTITLEMENTS_FILE_NAME));

            let value = Value::from_file(file.path())?;
            assert_eq!(value.as_dictionary(), Some(&document));

            file.path().to_path_buf()
        };
        assert!(!temp_path.exists());

        let work_dir = tempfile::tempdir()?;
        let target = work_dir.path().join("build");
        let file = EntitlementsFile::write(&document, Some(&target))?;
        assert_eq!(file.path(), target.join(ENTITLEMENTS_FILE_NAME));
        drop(file);
        assert!(target.join(ENTITLEMENTS_FILE_NAME).exists());

        Ok(())
    }
}
