// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing identities available in the keychain.
//!
//! Identities are discovered by parsing the output of
//! `security find-identity -p codesigning -v`, which looks like:
//!
//! ```text
//!   1) 0123456789ABCDEF0123456789ABCDEF01234567 "Apple Development: Jane Doe (ABCDE12345)"
//!   2) 89ABCDEF0123456789ABCDEF0123456789ABCDEF "Developer ID Application: Example (ABCDE12345)"
//!      2 valid identities found
//! ```

use {
    crate::{
        error::AppleProvisioningError, platform::SigningCapabilities, settings::SigningSettings,
        tools::SigningTools,
    },
    log::{debug, error, warn},
    once_cell::sync::Lazy,
    regex::Regex,
    serde::Serialize,
};

/// Matches a single identity line: `<index>) <FINGERPRINT> "<name>" <flags>`.
static IDENTITY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\d+\)\s+([0-9A-Fa-f]+)\s+"([^"]*)"\s*(.*)"#)
        .expect("identity line regular expression should compile")
});

/// Prefix of flags denoting an invalid (e.g. revoked or untrusted) certificate.
const IDENTITY_ERROR_FLAG: &str = "CSSMERR";

/// A certificate + private key pair usable for code signing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SigningIdentity {
    common_name: String,
    fingerprint: String,
}

impl SigningIdentity {
    /// Construct an instance from a SHA-1 fingerprint and certificate common name.
    ///
    /// The fingerprint is normalized to uppercase hex.
    pub fn new(fingerprint: impl AsRef<str>, common_name: impl ToString) -> Self {
        Self {
            common_name: common_name.to_string(),
            fingerprint: fingerprint.as_ref().to_uppercase(),
        }
    }

    /// Attempt to parse a line of `security find-identity` output.
    ///
    /// Returns `None` for lines not describing an identity and for identities
    /// flagged with a certificate error.
    pub fn from_find_identity_line(line: &str) -> Option<Self> {
        let captures = IDENTITY_LINE.captures(line.trim())?;

        let flags = captures.get(3).map(|m| m.as_str()).unwrap_or_default();
        if flags.trim_start_matches('(').starts_with(IDENTITY_ERROR_FLAG) {
            debug!("ignoring identity with error flags: {}", line.trim());
            return None;
        }

        Some(Self::new(&captures[1], &captures[2]))
    }

    /// The display name of the certificate, e.g. `Apple Development: Jane Doe (ABCDE12345)`.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Uppercase hex SHA-1 digest of the certificate.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Display for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.common_name, self.fingerprint)
    }
}

/// The set of signing identities discovered on this machine.
///
/// Identities are sorted case-insensitively by common name.
#[derive(Clone, Debug, Default)]
pub struct IdentityCatalog {
    identities: Vec<SigningIdentity>,
}

impl IdentityCatalog {
    /// Construct an instance from identities in arbitrary order.
    pub fn new(identities: impl IntoIterator<Item = SigningIdentity>) -> Self {
        let mut identities = identities.into_iter().collect::<Vec<_>>();
        identities.sort_by_key(|identity| identity.common_name.to_lowercase());

        Self { identities }
    }

    /// Construct an instance by parsing `security find-identity` output.
    ///
    /// Lines that aren't identities are ignored.
    pub fn from_find_identity_output(output: &str) -> Self {
        Self::new(output.lines().filter_map(SigningIdentity::from_find_identity_line))
    }

    /// Populate an instance by running the identity listing tool.
    ///
    /// Failure to run the tool results in an empty catalog.
    pub fn load(tools: &impl SigningTools) -> Self {
        match tools.find_identities() {
            Ok(output) if output.success() => {
                let catalog = Self::from_find_identity_output(&output.output);
                debug!("found {} signing identities", catalog.len());
                catalog
            }
            Ok(output) => {
                warn!("listing signing identities {}", output.status);
                Self::default()
            }
            Err(e) => {
                error!("error retrieving identities for code signing: {}", e);
                Self::default()
            }
        }
    }

    /// All identities, in catalog order.
    pub fn identities(&self) -> &[SigningIdentity] {
        &self.identities
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Find identities whose common name equals `name` exactly.
    pub fn find_by_name(&self, name: &str) -> Vec<&SigningIdentity> {
        debug!(
            "finding identity by name from {} identities",
            self.identities.len()
        );
        self.identities
            .iter()
            .filter(|identity| identity.common_name == name)
            .collect()
    }

    /// Find identities whose common name matches `pattern`.
    ///
    /// If `user_name` is given, the common name must also contain it.
    pub fn find_by_pattern(
        &self,
        pattern: &Regex,
        user_name: Option<&str>,
    ) -> Vec<&SigningIdentity> {
        debug!(
            "finding identity by pattern from {} identities",
            self.identities.len()
        );
        self.identities
            .iter()
            .filter(|identity| pattern.is_match(&identity.common_name))
            .filter(|identity| match user_name {
                Some(user) => identity.common_name.contains(user),
                None => true,
            })
            .collect()
    }

    /// Select the identities eligible for signing given settings.
    ///
    /// An explicitly configured identity name takes precedence over pattern
    /// matching against the platform's identity naming conventions.
    pub fn select(
        &self,
        settings: &SigningSettings,
        capabilities: &SigningCapabilities,
    ) -> Result<Vec<&SigningIdentity>, AppleProvisioningError> {
        if let Some(name) = settings.identity() {
            return Ok(self.find_by_name(name));
        }

        let pattern = Regex::new(
            settings
                .identity_pattern()
                .unwrap_or(capabilities.identity_pattern),
        )?;

        Ok(self.find_by_pattern(&pattern, settings.identity_user_name()))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::tools::{CodesignRequest, ToolOutput, ToolStatus},
        indoc::indoc,
        std::{path::Path, time::Duration},
    };

    const FIND_IDENTITY_OUTPUT: &str = indoc! {r#"
          1) 0123456789ABCDEF0123456789ABCDEF01234567 "iPhone Developer: Zed Zulu (ZZZZZ11111)"
          2) 89ABCDEF0123456789ABCDEF0123456789ABCDEF "Apple Development: Jane Doe (ABCDE12345)"
          3) 1111111111111111111111111111111111111111 "Developer ID Application: Example Corp (ABCDE12345)"
          4) 2222222222222222222222222222222222222222 "Apple Development: Revoked (ABCDE12345)" (CSSMERR_TP_CERT_REVOKED)
          5) 3333333333333333333333333333333333333333 "apple development: lower case (ABCDE12345)"
             4 valid identities found
    "#};

    struct ListingTools(ToolOutput);

    impl SigningTools for ListingTools {
        fn find_identities(&self) -> Result<ToolOutput, AppleProvisioningError> {
            Ok(self.0.clone())
        }

        fn codesign(
            &self,
            _: &CodesignRequest,
            _: Duration,
        ) -> Result<ToolOutput, AppleProvisioningError> {
            unreachable!()
        }

        fn verify(&self, _: &Path, _: Duration) -> Result<ToolOutput, AppleProvisioningError> {
            unreachable!()
        }

        fn default_keychain(&self) -> Result<ToolOutput, AppleProvisioningError> {
            unreachable!()
        }

        fn unlock_keychain(&self, _: &Path) -> Result<ToolOutput, AppleProvisioningError> {
            unreachable!()
        }

        fn sdk_tool(&self, _: &str, _: &str) -> Result<ToolOutput, AppleProvisioningError> {
            unreachable!()
        }
    }

    #[test]
    fn parse_line() {
        let identity = SigningIdentity::from_find_identity_line(
            r#"  1) 0123456789abcdef0123456789abcdef01234567 "Apple Development: Jane Doe (ABCDE12345)""#,
        )
        .unwrap();
        assert_eq!(
            identity.common_name(),
            "Apple Development: Jane Doe (ABCDE12345)"
        );
        assert_eq!(
            identity.fingerprint(),
            "0123456789ABCDEF0123456789ABCDEF01234567"
        );

        assert!(SigningIdentity::from_find_identity_line("     2 valid identities found").is_none());
        assert!(SigningIdentity::from_find_identity_line("").is_none());
        assert!(SigningIdentity::from_find_identity_line(
            r#"1) 2222222222222222222222222222222222222222 "Apple Development: X" CSSMERR_TP_NOT_TRUSTED"#
        )
        .is_none());
    }

    #[test]
    fn catalog_sorted_case_insensitive() {
        let catalog = IdentityCatalog::from_find_identity_output(FIND_IDENTITY_OUTPUT);

        let names = catalog
            .identities()
            .iter()
            .map(|identity| identity.common_name())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "Apple Development: Jane Doe (ABCDE12345)",
                "apple development: lower case (ABCDE12345)",
                "Developer ID Application: Example Corp (ABCDE12345)",
                "iPhone Developer: Zed Zulu (ZZZZZ11111)",
            ]
        );
    }

    #[test]
    fn filter_by_name_and_pattern() -> Result<(), AppleProvisioningError> {
        let catalog = IdentityCatalog::from_find_identity_output(FIND_IDENTITY_OUTPUT);
        let ios = SigningCapabilities::ios();

        let selected = catalog.select(&SigningSettings::default(), &ios)?;
        assert_eq!(selected.len(), 3);
        assert!(selected
            .iter()
            .all(|identity| !identity.common_name().starts_with("Developer ID")));

        let mut settings = SigningSettings::default();
        settings.set_identity("Developer ID Application: Example Corp (ABCDE12345)");
        let selected = catalog.select(&settings, &ios)?;
        assert_eq!(selected.len(), 1);
        assert_eq!(
            selected[0].fingerprint(),
            "1111111111111111111111111111111111111111"
        );

        // Exact name matching is case sensitive.
        settings.set_identity("apple development: jane doe (ABCDE12345)");
        assert!(catalog.select(&settings, &ios)?.is_empty());

        let mut settings = SigningSettings::default();
        settings.set_identity_user_name("Jane");
        let selected = catalog.select(&settings, &SigningCapabilities::macos())?;
        assert_eq!(selected.len(), 1);
        assert_eq!(
            selected[0].common_name(),
            "Apple Development: Jane Doe (ABCDE12345)"
        );

        Ok(())
    }

    #[test]
    fn load_from_tool() {
        let catalog = IdentityCatalog::load(&ListingTools(ToolOutput::new(
            ToolStatus::Success,
            FIND_IDENTITY_OUTPUT,
        )));
        assert_eq!(catalog.len(), 4);

        let catalog = IdentityCatalog::load(&ListingTools(ToolOutput::new(
            ToolStatus::Failed(Some(1)),
            FIND_IDENTITY_OUTPUT,
        )));
        assert!(catalog.is_empty());

        let catalog = IdentityCatalog::load(&ListingTools(ToolOutput::new(
            ToolStatus::Success,
            "     0 valid identities found\n",
        )));
        assert!(catalog.is_empty());
    }
}
