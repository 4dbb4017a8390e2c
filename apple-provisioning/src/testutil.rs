// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        error::AppleProvisioningError,
        profile::{ProvisioningProfile, ENTITLEMENT_APPLICATION_IDENTIFIER},
        tools::{CodesignRequest, SigningTools, ToolOutput, ToolStatus},
    },
    chrono::NaiveDate,
    plist::{Dictionary, Value},
    std::{
        cell::RefCell,
        collections::VecDeque,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// SHA-1 fingerprint of `testdata/developer-certificate.der`.
pub const DEVELOPER_CERTIFICATE_FINGERPRINT: &str = "44DEC82D3EA470E9772AF756B91CC23F512BFE3F";

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

/// Construct a profile whose application identifier is `<prefix>.<scope>`.
pub fn profile_with_scope(
    name: &str,
    prefix: &str,
    scope: &str,
    fingerprints: &[&str],
    expiration_date: NaiveDate,
) -> ProvisioningProfile {
    let mut entitlements = Dictionary::new();
    entitlements.insert(
        ENTITLEMENT_APPLICATION_IDENTIFIER.to_string(),
        Value::String(format!("{}.{}", prefix, scope)),
    );

    ProvisioningProfile::new(
        format!("{}.mobileprovision", name),
        name,
        Some(prefix.to_string()),
        entitlements,
        expiration_date,
    )
    .with_developer_certificate_fingerprints(fingerprints)
}

/// A [SigningTools] returning scripted output and recording what was asked of it.
///
/// Queued outputs are consumed in order. Once a queue is exhausted, a
/// successful default is returned.
#[derive(Default)]
pub struct ScriptedTools {
    pub identities: String,
    pub codesign_outputs: RefCell<VecDeque<ToolOutput>>,
    pub verify_outputs: RefCell<VecDeque<ToolOutput>>,
    pub default_keychain_output: Option<ToolOutput>,
    pub unlock_outputs: RefCell<VecDeque<ToolOutput>>,

    pub find_identities_calls: RefCell<usize>,
    pub codesign_requests: RefCell<Vec<CodesignRequest>>,
    pub verify_requests: RefCell<Vec<PathBuf>>,
    pub unlock_requests: RefCell<Vec<PathBuf>>,
    pub sdk_tool_requests: RefCell<Vec<(String, String)>>,
}

impl ScriptedTools {
    pub fn with_identities(identities: &str) -> Self {
        Self {
            identities: identities.to_string(),
            ..Default::default()
        }
    }

    pub fn queue_codesign(&self, status: ToolStatus, output: &str) {
        self.codesign_outputs
            .borrow_mut()
            .push_back(ToolOutput::new(status, output));
    }

    pub fn queue_verify(&self, status: ToolStatus, output: &str) {
        self.verify_outputs
            .borrow_mut()
            .push_back(ToolOutput::new(status, output));
    }

    pub fn queue_unlock(&self, status: ToolStatus, output: &str) {
        self.unlock_outputs
            .borrow_mut()
            .push_back(ToolOutput::new(status, output));
    }

    /// Targets passed to `codesign`, in invocation order.
    pub fn signed_targets(&self) -> Vec<PathBuf> {
        self.codesign_requests
            .borrow()
            .iter()
            .map(|request| request.target.clone())
            .collect()
    }
}

impl SigningTools for ScriptedTools {
    fn find_identities(&self) -> Result<ToolOutput, AppleProvisioningError> {
        *self.find_identities_calls.borrow_mut() += 1;

        Ok(ToolOutput::new(ToolStatus::Success, &self.identities))
    }

    fn codesign(
        &self,
        request: &CodesignRequest,
        _: Duration,
    ) -> Result<ToolOutput, AppleProvisioningError> {
        self.codesign_requests.borrow_mut().push(request.clone());

        Ok(self
            .codesign_outputs
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| ToolOutput::new(ToolStatus::Success, "")))
    }

    fn verify(&self, target: &Path, _: Duration) -> Result<ToolOutput, AppleProvisioningError> {
        self.verify_requests.borrow_mut().push(target.to_path_buf());

        Ok(self
            .verify_outputs
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| {
                ToolOutput::new(
                    ToolStatus::Success,
                    format!(
                        "{0}: valid on disk\n{0}: satisfies its Designated Requirement\n",
                        target.display()
                    ),
                )
            }))
    }

    fn default_keychain(&self) -> Result<ToolOutput, AppleProvisioningError> {
        Ok(self
            .default_keychain_output
            .clone()
            .unwrap_or_else(|| ToolOutput::new(ToolStatus::Failed(Some(1)), "")))
    }

    fn unlock_keychain(&self, keychain: &Path) -> Result<ToolOutput, AppleProvisioningError> {
        self.unlock_requests.borrow_mut().push(keychain.to_path_buf());

        Ok(self
            .unlock_outputs
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| ToolOutput::new(ToolStatus::Success, "")))
    }

    fn sdk_tool(&self, sdk: &str, tool: &str) -> Result<ToolOutput, AppleProvisioningError> {
        self.sdk_tool_requests
            .borrow_mut()
            .push((sdk.to_string(), tool.to_string()));

        Ok(ToolOutput::new(
            ToolStatus::Success,
            format!("/Applications/Xcode.app/Contents/Developer/usr/bin/{}\n", tool),
        ))
    }
}
