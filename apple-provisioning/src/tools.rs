// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Invocation of Apple's command line signing tools.
//!
//! Everything that shells out to `security`, `codesign`, or `xcrun` goes
//! through the [SigningTools] trait. [SystemSigningTools] is the real
//! implementation. Tests substitute their own implementation to script tool
//! output.

use {
    crate::error::AppleProvisioningError,
    log::{debug, warn},
    std::{
        fmt::Formatter,
        path::{Path, PathBuf},
        time::{Duration, Instant},
    },
};

/// How frequently a running process is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Describes how an external tool invocation ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ToolStatus {
    /// Process exited with code 0.
    Success,
    /// Process exited with a non-zero code, or was terminated by a signal.
    Failed(Option<i32>),
    /// Process did not finish within the allotted time and was killed.
    TimedOut(Duration),
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("exited successfully"),
            Self::Failed(Some(code)) => write!(f, "failed with exit code {}", code),
            Self::Failed(None) => f.write_str("was terminated by a signal"),
            Self::TimedOut(limit) => write!(f, "timed out after {}s", limit.as_secs()),
        }
    }
}

/// The result of running an external tool.
///
/// stderr is merged into stdout so `output` holds everything the tool printed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ToolOutput {
    pub status: ToolStatus,
    pub output: String,
}

impl ToolOutput {
    pub fn new(status: ToolStatus, output: impl ToString) -> Self {
        Self {
            status,
            output: output.to_string(),
        }
    }

    /// Whether the tool exited with code 0.
    pub fn success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// Iterate over lines of output.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines()
    }

    /// Whether any output line contains the given fragment.
    pub fn contains(&self, fragment: &str) -> bool {
        self.lines().any(|line| line.contains(fragment))
    }

    /// Convert to a [Result], erroring unless the tool exited successfully.
    pub fn into_result(self, tool: &'static str) -> Result<Self, AppleProvisioningError> {
        if self.success() {
            Ok(self)
        } else {
            Err(AppleProvisioningError::ToolFailure {
                tool,
                status: self.status,
                output: self.output,
            })
        }
    }
}

/// Describes a `codesign` signing invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CodesignRequest {
    /// SHA-1 fingerprint of the signing identity.
    pub fingerprint: String,

    /// Entitlements plist to embed in the signature.
    pub entitlements: Option<PathBuf>,

    /// Extra arguments placed before `--force --sign`.
    pub flags: Vec<String>,

    /// Whether to ask `codesign` for verbose output.
    pub verbose: bool,

    /// The file or bundle to sign.
    pub target: PathBuf,

    /// Environment variables to define for the process.
    pub environment: Vec<(String, String)>,
}

impl CodesignRequest {
    /// Obtain the `codesign` arguments for this request.
    pub fn arguments(&self) -> Vec<String> {
        let mut args = self.flags.clone();
        args.push("--force".to_string());
        args.push("--sign".to_string());
        args.push(self.fingerprint.clone());

        if let Some(path) = &self.entitlements {
            args.push("--entitlements".to_string());
            args.push(format!("{}", path.display()));
        }

        if self.verbose {
            args.push("--verbose".to_string());
        }

        args.push(format!("{}", self.target.display()));

        args
    }
}

/// Interface to the external programs used for signing.
pub trait SigningTools {
    /// List code signing identities (`security find-identity -p codesigning -v`).
    fn find_identities(&self) -> Result<ToolOutput, AppleProvisioningError>;

    /// Sign a target (`codesign ... --sign`).
    fn codesign(
        &self,
        request: &CodesignRequest,
        timeout: Duration,
    ) -> Result<ToolOutput, AppleProvisioningError>;

    /// Verify the signature of a target (`codesign --verify -vvvv`).
    fn verify(&self, target: &Path, timeout: Duration)
        -> Result<ToolOutput, AppleProvisioningError>;

    /// Print the user's default keychain (`security default-keychain -d user`).
    fn default_keychain(&self) -> Result<ToolOutput, AppleProvisioningError>;

    /// Unlock a keychain (`security unlock-keychain`).
    ///
    /// This normally prompts the user for a password.
    fn unlock_keychain(&self, keychain: &Path) -> Result<ToolOutput, AppleProvisioningError>;

    /// Locate a tool within an SDK (`xcrun -sdk <sdk> -f <tool>`).
    fn sdk_tool(&self, sdk: &str, tool: &str) -> Result<ToolOutput, AppleProvisioningError>;
}

/// [SigningTools] implemented by running the programs installed on the system.
#[derive(Clone, Debug)]
pub struct SystemSigningTools {
    security_exe: PathBuf,
    codesign_exe: PathBuf,
    xcrun_exe: PathBuf,
}

impl Default for SystemSigningTools {
    fn default() -> Self {
        Self {
            security_exe: PathBuf::from("security"),
            codesign_exe: PathBuf::from("codesign"),
            xcrun_exe: PathBuf::from("xcrun"),
        }
    }
}

impl SigningTools for SystemSigningTools {
    fn find_identities(&self) -> Result<ToolOutput, AppleProvisioningError> {
        run_expression(
            "security",
            duct::cmd(
                &self.security_exe,
                &["find-identity", "-p", "codesigning", "-v"],
            ),
            None,
        )
    }

    fn codesign(
        &self,
        request: &CodesignRequest,
        timeout: Duration,
    ) -> Result<ToolOutput, AppleProvisioningError> {
        let mut expression = duct::cmd(&self.codesign_exe, request.arguments());
        for (key, value) in &request.environment {
            expression = expression.env(key, value);
        }

        run_expression("codesign", expression, Some(timeout))
    }

    fn verify(
        &self,
        target: &Path,
        timeout: Duration,
    ) -> Result<ToolOutput, AppleProvisioningError> {
        let target = std::fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());

        run_expression(
            "codesign --verify",
            duct::cmd!(&self.codesign_exe, "--verify", "-vvvv", target),
            Some(timeout),
        )
    }

    fn default_keychain(&self) -> Result<ToolOutput, AppleProvisioningError> {
        run_expression(
            "security default-keychain",
            duct::cmd(&self.security_exe, &["default-keychain", "-d", "user"]),
            None,
        )
    }

    fn unlock_keychain(&self, keychain: &Path) -> Result<ToolOutput, AppleProvisioningError> {
        run_expression(
            "security unlock-keychain",
            duct::cmd!(&self.security_exe, "unlock-keychain", keychain),
            None,
        )
    }

    fn sdk_tool(&self, sdk: &str, tool: &str) -> Result<ToolOutput, AppleProvisioningError> {
        run_expression(
            "xcrun",
            duct::cmd(&self.xcrun_exe, &["-sdk", sdk, "-f", tool]),
            None,
        )
    }
}

/// Run a [duct::Expression], capturing its output and optionally bounding its run time.
///
/// A process exceeding `timeout` is killed and reported as [ToolStatus::TimedOut].
/// `Err` is only returned if the process could not be spawned or waited on.
fn run_expression(
    name: &str,
    expression: duct::Expression,
    timeout: Option<Duration>,
) -> Result<ToolOutput, AppleProvisioningError> {
    debug!("running {}", name);

    let handle = expression
        .stderr_to_stdout()
        .stdout_capture()
        .unchecked()
        .start()?;

    let mut timed_out = None;

    let output = match timeout {
        Some(limit) => {
            let start_time = Instant::now();

            loop {
                if let Some(output) = handle.try_wait()? {
                    break output;
                }

                if start_time.elapsed() >= limit {
                    warn!("{} did not finish within {}s; killing", name, limit.as_secs());
                    handle.kill()?;
                    timed_out = Some(limit);

                    break handle.wait()?;
                }

                std::thread::sleep(POLL_INTERVAL);
            }
        }
        None => handle.wait()?,
    };

    let text = String::from_utf8_lossy(&output.stdout).to_string();
    for line in text.lines() {
        debug!("{}> {}", name, line);
    }

    let status = if let Some(limit) = timed_out {
        ToolStatus::TimedOut(limit)
    } else if output.status.success() {
        ToolStatus::Success
    } else {
        ToolStatus::Failed(output.status.code())
    };
    debug!("{} {}", name, status);

    Ok(ToolOutput::new(status, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codesign_arguments() {
        let request = CodesignRequest {
            fingerprint: "ABCDEF".to_string(),
            entitlements: Some(PathBuf::from("/tmp/Entitlements.plist")),
            flags: vec!["--generate-entitlement-der".to_string()],
            verbose: true,
            target: PathBuf::from("/build/MyApp.app"),
            environment: vec![],
        };

        assert_eq!(
            request.arguments(),
            vec![
                "--generate-entitlement-der",
                "--force",
                "--sign",
                "ABCDEF",
                "--entitlements",
                "/tmp/Entitlements.plist",
                "--verbose",
                "/build/MyApp.app"
            ]
        );

        let request = CodesignRequest {
            fingerprint: "ABCDEF".to_string(),
            target: PathBuf::from("MyApp.dmg"),
            ..Default::default()
        };
        assert_eq!(
            request.arguments(),
            vec!["--force", "--sign", "ABCDEF", "MyApp.dmg"]
        );
    }

    #[test]
    fn output_inspection() {
        let output = ToolOutput::new(
            ToolStatus::Success,
            "MyApp.app: valid on disk\nMyApp.app: satisfies its Designated Requirement\n",
        );
        assert!(output.success());
        assert!(output.contains("valid on disk"));
        assert!(!output.contains("errSecInternalComponent"));
        assert_eq!(output.lines().count(), 2);

        let failed = ToolOutput::new(ToolStatus::Failed(Some(1)), "boom");
        match failed.into_result("codesign") {
            Err(AppleProvisioningError::ToolFailure { tool, status, output }) => {
                assert_eq!(tool, "codesign");
                assert_eq!(status, ToolStatus::Failed(Some(1)));
                assert_eq!(output, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn status_display() {
        assert_eq!(
            format!("{}", ToolStatus::Failed(Some(3))),
            "failed with exit code 3"
        );
        assert_eq!(
            format!("{}", ToolStatus::TimedOut(Duration::from_secs(5))),
            "timed out after 5s"
        );
    }

    #[cfg(unix)]
    #[test]
    fn run_captures_and_times_out() -> Result<(), AppleProvisioningError> {
        let output = run_expression(
            "sh",
            duct::cmd!("sh", "-c", "echo out; echo err 1>&2; exit 3"),
            Some(Duration::from_secs(10)),
        )?;
        assert_eq!(output.status, ToolStatus::Failed(Some(3)));
        assert!(output.contains("out"));
        assert!(output.contains("err"));

        let output = run_expression(
            "sleep",
            duct::cmd!("sleep", "10"),
            Some(Duration::from_millis(200)),
        )?;
        assert_eq!(
            output.status,
            ToolStatus::TimedOut(Duration::from_millis(200))
        );

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn timed_out_keeps_partial_output() -> Result<(), AppleProvisioningError> {
        let output = run_expression(
            "sh",
            duct::cmd!("sh", "-c", "echo partial-diagnostic; exec sleep 10"),
            Some(Duration::from_millis(500)),
        )?;
        assert_eq!(
            output.status,
            ToolStatus::TimedOut(Duration::from_millis(500))
        );
        assert!(output.contains("partial-diagnostic"));

        let err = output.into_result("codesign").unwrap_err();
        assert!(err
            .captured_output()
            .map_or(false, |output| output.contains("partial-diagnostic")));

        Ok(())
    }
}
