// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running `codesign` and verifying its result.
//!
//! A signing attempt moves through [SigningState]s:
//!
//! ```text
//! Idle -> Signing -> Verifying -> Signed
//!            |           |
//!            +-----------+------> Failed
//! ```
//!
//! A signature is only trusted once `codesign --verify` reports one of the
//! accepted phrases. A successful exit status alone is not sufficient.
//!
//! If `codesign` reports that the keychain is locked, the user's default
//! keychain is unlocked (which prompts for a password) and the sign step is
//! retried once.

use {
    crate::{
        error::AppleProvisioningError,
        identity::SigningIdentity,
        platform::{SigningCapabilities, KEYCHAIN_LOCKED_MESSAGE},
        tools::{CodesignRequest, SigningTools, ToolOutput},
    },
    log::{debug, info, warn},
    std::path::{Path, PathBuf},
};

/// Where a signing attempt is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigningState {
    Idle,
    Signing,
    Verifying,
    Signed,
    Failed,
}

/// Signs and verifies paths using [SigningTools].
pub struct SigningExecutor<'t, T: SigningTools> {
    tools: &'t T,
    capabilities: SigningCapabilities,
    verbose: bool,
    environment: Vec<(String, String)>,
    state: SigningState,
}

impl<'t, T: SigningTools> SigningExecutor<'t, T> {
    pub fn new(tools: &'t T, capabilities: SigningCapabilities) -> Self {
        Self {
            tools,
            capabilities,
            verbose: false,
            environment: vec![],
            state: SigningState::Idle,
        }
    }

    /// Set whether `codesign` is asked for verbose output.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Define an environment variable for `codesign` invocations.
    pub fn set_environment(&mut self, key: impl ToString, value: impl ToString) {
        self.environment.push((key.to_string(), value.to_string()));
    }

    pub fn state(&self) -> SigningState {
        self.state
    }

    fn request(
        &self,
        identity: &SigningIdentity,
        entitlements: Option<&Path>,
        target: &Path,
    ) -> CodesignRequest {
        CodesignRequest {
            fingerprint: identity.fingerprint().to_string(),
            entitlements: entitlements.map(|p| p.to_path_buf()),
            flags: self
                .capabilities
                .codesign_flags
                .iter()
                .map(|s| s.to_string())
                .collect(),
            verbose: self.verbose,
            target: target.to_path_buf(),
            environment: self.environment.clone(),
        }
    }

    /// Sign `target` and verify the result.
    ///
    /// `inner_targets` are signed in order before `target`, e.g. the main
    /// executable of a macOS bundle. Only `target` is verified.
    ///
    /// A locked keychain is unlocked at most once per call.
    pub fn sign_and_verify(
        &mut self,
        identity: &SigningIdentity,
        entitlements: Option<&Path>,
        target: &Path,
        inner_targets: &[PathBuf],
    ) -> Result<ToolOutput, AppleProvisioningError> {
        let res = self.sign_all(identity, entitlements, target, inner_targets);

        if res.is_err() {
            self.state = SigningState::Failed;
        }

        res
    }

    fn sign_all(
        &mut self,
        identity: &SigningIdentity,
        entitlements: Option<&Path>,
        target: &Path,
        inner_targets: &[PathBuf],
    ) -> Result<ToolOutput, AppleProvisioningError> {
        self.state = SigningState::Signing;
        info!("signing {} with identity {}", target.display(), identity);

        let mut unlock_available = true;

        for path in inner_targets.iter().map(|p| p.as_path()).chain([target]) {
            let request = self.request(identity, entitlements, path);
            self.sign_once(&request, &mut unlock_available)?;
        }

        self.verify(target)
    }

    /// Run `codesign` for a request, unlocking the keychain and retrying if permitted.
    fn sign_once(
        &self,
        request: &CodesignRequest,
        unlock_available: &mut bool,
    ) -> Result<(), AppleProvisioningError> {
        loop {
            let output = self
                .tools
                .codesign(request, self.capabilities.sign_timeout)?;

            if output.contains(KEYCHAIN_LOCKED_MESSAGE) {
                if !*unlock_available {
                    return Err(AppleProvisioningError::KeychainLocked(output.output));
                }
                *unlock_available = false;

                warn!(
                    "error signing {}: the keychain is locked; you will be required to unlock it",
                    request.target.display()
                );
                self.unlock_keychain()?;
                continue;
            }

            output.into_result("codesign")?;
            debug!("signed {}", request.target.display());

            return Ok(());
        }
    }

    /// Unlock the user's default keychain.
    ///
    /// `security unlock-keychain` prompts for the keychain password, so this
    /// requires user interaction.
    pub fn unlock_keychain(&self) -> Result<PathBuf, AppleProvisioningError> {
        let output = self.tools.default_keychain()?;
        let keychain = output.output.trim().replace('"', "");

        if !output.success() || keychain.is_empty() {
            return Err(AppleProvisioningError::KeychainUnlock(
                "user's default keychain not found".into(),
            ));
        }

        let keychain = PathBuf::from(keychain);
        if !keychain.exists() {
            return Err(AppleProvisioningError::KeychainUnlock(format!(
                "invalid keychain at {}",
                keychain.display()
            )));
        }

        let output = self.tools.unlock_keychain(&keychain)?;
        if !output.success() || !output.output.trim().is_empty() {
            return Err(AppleProvisioningError::KeychainUnlock(
                "wrong keychain password".into(),
            ));
        }

        info!("keychain {} unlocked", keychain.display());

        Ok(keychain)
    }

    /// Verify the signature of `target`.
    ///
    /// Succeeds only if the verification output contains an accepted phrase.
    pub fn verify(&mut self, target: &Path) -> Result<ToolOutput, AppleProvisioningError> {
        self.state = SigningState::Verifying;
        debug!("verifying signature of {}", target.display());

        let res = self
            .tools
            .verify(target, self.capabilities.verify_timeout)
            .and_then(|output| output.into_result("codesign --verify"))
            .and_then(|output| {
                if self
                    .capabilities
                    .verify_accepted
                    .iter()
                    .any(|phrase| output.contains(phrase))
                {
                    Ok(output)
                } else {
                    Err(AppleProvisioningError::VerificationMismatch(
                        target.to_path_buf(),
                        output.output,
                    ))
                }
            });

        self.state = match res {
            Ok(_) => {
                info!("signature of {} verified", target.display());
                SigningState::Signed
            }
            Err(_) => SigningState::Failed,
        };

        res
    }
}
