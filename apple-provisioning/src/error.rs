// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::tools::ToolStatus,
    cryptographic_message_syntax::CmsError,
    std::path::PathBuf,
    thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Unified error type for signing identity and provisioning profile handling.
#[derive(Debug, Error)]
pub enum AppleProvisioningError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument")]
    CliBadArgument,

    #[error("{0}")]
    CliGeneralError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("bad regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("no valid signing identity (certificate) found for {0} development")]
    NoSigningIdentity(&'static str),

    #[error("no provisioning profile found matching any signing identity and bundle id {0}")]
    NoMatchingProfile(String),

    #[error("provisioning profile {0} was requested but no matching profile was found")]
    ProfileNotFound(String),

    #[error("error decoding provisioning profile {0}: {1}")]
    ProfileDecode(PathBuf, String),

    #[error("provisioning profile is not signed data with embedded content")]
    ProfileNoContent,

    #[error("entitlements plist root is not a dictionary: {0}")]
    EntitlementsNotDictionary(String),

    #[error("bundle Info.plist does not define CFBundleIdentifier: {0}")]
    BundleNoIdentifier(PathBuf),

    #[error("bundle Info.plist does not define CFBundleExecutable: {0}")]
    BundleNoMainExecutable(PathBuf),

    #[error("error interfacing with directory-based bundle: {0}")]
    DirectoryBundle(anyhow::Error),

    #[error("{tool} {status}")]
    ToolFailure {
        tool: &'static str,
        status: ToolStatus,
        output: String,
    },

    #[error("signature verification of {0} did not report an accepted result")]
    VerificationMismatch(PathBuf, String),

    #[error("the keychain is locked and signing could not proceed")]
    KeychainLocked(String),

    #[error("unable to unlock keychain: {0}")]
    KeychainUnlock(String),
}

impl AppleProvisioningError {
    /// Obtain the output captured from an external tool, if this error carries any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::ToolFailure { output, .. } => Some(output.as_str()),
            Self::VerificationMismatch(_, output) => Some(output.as_str()),
            Self::KeychainLocked(output) => Some(output.as_str()),
            _ => None,
        }
    }

    /// Whether this error is a fatal signing failure as opposed to a usage error.
    pub fn is_signing_failure(&self) -> bool {
        matches!(
            self,
            Self::NoSigningIdentity(_)
                | Self::NoMatchingProfile(_)
                | Self::ProfileNotFound(_)
                | Self::ToolFailure { .. }
                | Self::VerificationMismatch(..)
                | Self::KeychainLocked(_)
                | Self::KeychainUnlock(_)
        )
    }
}
