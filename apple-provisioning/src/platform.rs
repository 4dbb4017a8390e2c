// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-platform signing capabilities.
//!
//! iOS and macOS share the same resolution and signing machinery. What differs
//! between them is a handful of constants: where provisioning profiles live and
//! how they are named, which certificates are considered signing identities,
//! which flags `codesign` is invoked with, and so on. [SigningCapabilities]
//! captures those differences as data.

use std::{path::PathBuf, time::Duration};

/// Output fragments of `codesign --verify` that denote an accepted signature.
///
/// See https://developer.apple.com/library/archive/technotes/tn2318/_index.html.
pub const CODESIGN_VERIFY_ACCEPTED: &[&str] = &[
    "satisfies its Designated Requirement",
    "valid on disk",
    "explicit requirement satisfied",
];

/// Output fragment of `codesign` indicating the keychain holding the key is locked.
pub const KEYCHAIN_LOCKED_MESSAGE: &str = "errSecInternalComponent";

/// Default wall time allowed for a `codesign` signing invocation.
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wall time allowed for a `codesign --verify` invocation.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

const IOS_IDENTITY_PATTERN: &str =
    "(?i)iPhone Developer|Apple Development|iOS Development|iPhone Distribution";

const MACOS_IDENTITY_PATTERN: &str = "(?i)Apple Development|Apple Distribution|Mac Developer|\
     Developer ID Application|3rd Party Mac Developer Application";

const IOS_ENTITLEMENTS_TEMPLATE: &str = include_str!("templates/ios-entitlements.plist");
const MACOS_ENTITLEMENTS_TEMPLATE: &str = include_str!("templates/macos-entitlements.plist");

/// Entitlements forced on for macOS App Store builds unless explicitly set.
const MACOS_SANDBOX_ENTITLEMENTS: &[&str] = &[
    "com.apple.security.app-sandbox",
    "com.apple.security.cs.allow-unsigned-executable-memory",
    "com.apple.security.cs.disable-library-validation",
    "com.apple.security.cs.debugger",
    "com.apple.security.device.audio-input",
];

/// An Apple operating system we can sign applications for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplePlatform {
    Ios,
    MacOs,
}

impl ApplePlatform {
    /// Human readable name of the platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "iOS",
            Self::MacOs => "macOS",
        }
    }
}

impl std::fmt::Display for ApplePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ApplePlatform {
    type Error = String;

    fn try_from(v: &str) -> Result<Self, Self::Error> {
        match v.to_lowercase().as_str() {
            "ios" => Ok(Self::Ios),
            "macos" => Ok(Self::MacOs),
            _ => Err(format!("{} is not a valid platform; use ios or macos", v)),
        }
    }
}

/// Describes how signing behaves on a given [ApplePlatform].
#[derive(Clone, Debug)]
pub struct SigningCapabilities {
    /// The platform these capabilities describe.
    pub platform: ApplePlatform,

    /// Regular expression a certificate common name must match to be a signing identity.
    pub identity_pattern: &'static str,

    /// File extension of provisioning profiles for this platform.
    pub profile_extension: &'static str,

    /// Path relative to the bundle root where the provisioning profile is embedded.
    pub embedded_profile_path: &'static str,

    /// Whether bundle identifiers are generalized towards wildcard scopes during matching.
    pub generalize_bundle_id: bool,

    /// Whether failing to find a provisioning profile aborts signing.
    pub profile_required: bool,

    /// Whether the bundle's main executable is signed before the bundle itself.
    pub sign_main_executable: bool,

    /// Arguments passed to `codesign` ahead of `--force --sign`.
    pub codesign_flags: &'static [&'static str],

    /// SDK whose `codesign_allocate` is exported as `CODESIGN_ALLOCATE`.
    pub codesign_allocate_sdk: Option<&'static str>,

    /// Verification output fragments accepted as proof of a valid signature.
    pub verify_accepted: &'static [&'static str],

    /// Entitlements set to `true` when the template does not define them.
    pub implied_entitlements: &'static [&'static str],

    /// XML plist content of the default entitlements template.
    pub default_entitlements: &'static str,

    pub sign_timeout: Duration,
    pub verify_timeout: Duration,
}

impl SigningCapabilities {
    /// Capabilities for signing iOS application bundles.
    pub fn ios() -> Self {
        Self {
            platform: ApplePlatform::Ios,
            identity_pattern: IOS_IDENTITY_PATTERN,
            profile_extension: "mobileprovision",
            embedded_profile_path: "embedded.mobileprovision",
            generalize_bundle_id: true,
            profile_required: true,
            sign_main_executable: false,
            codesign_flags: &["--generate-entitlement-der"],
            codesign_allocate_sdk: Some("iphoneos"),
            verify_accepted: CODESIGN_VERIFY_ACCEPTED,
            implied_entitlements: &[],
            default_entitlements: IOS_ENTITLEMENTS_TEMPLATE,
            sign_timeout: DEFAULT_SIGN_TIMEOUT,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    /// Capabilities for signing macOS application bundles.
    pub fn macos() -> Self {
        Self {
            platform: ApplePlatform::MacOs,
            identity_pattern: MACOS_IDENTITY_PATTERN,
            profile_extension: "provisionprofile",
            embedded_profile_path: "Contents/embedded.provisionprofile",
            generalize_bundle_id: false,
            profile_required: false,
            sign_main_executable: true,
            codesign_flags: &["--timestamp", "--options", "runtime"],
            codesign_allocate_sdk: None,
            verify_accepted: CODESIGN_VERIFY_ACCEPTED,
            implied_entitlements: MACOS_SANDBOX_ENTITLEMENTS,
            default_entitlements: MACOS_ENTITLEMENTS_TEMPLATE,
            sign_timeout: DEFAULT_SIGN_TIMEOUT,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    /// Obtain capabilities for a platform.
    pub fn for_platform(platform: ApplePlatform) -> Self {
        match platform {
            ApplePlatform::Ios => Self::ios(),
            ApplePlatform::MacOs => Self::macos(),
        }
    }
}

/// The directory where Xcode installs provisioning profiles for the current user.
///
/// Returns `None` if the home directory cannot be resolved. The returned path
/// is not verified to exist.
pub fn default_provisioning_profiles_directory() -> Option<PathBuf> {
    dirs::home_dir().map(|home| {
        home.join("Library")
            .join("MobileDevice")
            .join("Provisioning Profiles")
    })
}

#[cfg(test)]
mod tests {
    use {super::*, regex::Regex};

    #[test]
    fn platform_parse() {
        assert_eq!(ApplePlatform::try_from("iOS"), Ok(ApplePlatform::Ios));
        assert_eq!(ApplePlatform::try_from("macos"), Ok(ApplePlatform::MacOs));
        assert!(ApplePlatform::try_from("watchos").is_err());
    }

    #[test]
    fn identity_patterns() -> Result<(), regex::Error> {
        let ios = Regex::new(SigningCapabilities::ios().identity_pattern)?;
        assert!(ios.is_match("Apple Development: Jane Doe (ABCDE12345)"));
        assert!(ios.is_match("iphone distribution: Example Corp"));
        assert!(!ios.is_match("Developer ID Application: Example Corp"));

        let macos = Regex::new(SigningCapabilities::macos().identity_pattern)?;
        assert!(macos.is_match("Developer ID Application: Example Corp (ABCDE12345)"));
        assert!(macos.is_match("3rd Party Mac Developer Application: Example Corp"));
        assert!(!macos.is_match("iPhone Developer: Jane Doe"));

        Ok(())
    }

    #[test]
    fn templates_parse() -> Result<(), plist::Error> {
        for caps in [SigningCapabilities::ios(), SigningCapabilities::macos()] {
            let value = plist::Value::from_reader_xml(caps.default_entitlements.as_bytes())?;
            assert!(value.as_dictionary().is_some());
        }

        Ok(())
    }
}
