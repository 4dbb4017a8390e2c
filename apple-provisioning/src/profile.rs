// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning profiles.
//!
//! A provisioning profile (`.mobileprovision` on iOS, `.provisionprofile` on
//! macOS) is a CMS `SignedData` structure whose encapsulated content is a plist.
//! The plist declares which application identifiers the profile covers, which
//! developer certificates may sign those applications, the entitlements the
//! applications may claim, and when the profile expires.
//!
//! To inspect a profile on macOS, run `security cms -D -i <path>`.

use {
    crate::error::AppleProvisioningError,
    chrono::{DateTime, Local, NaiveDate},
    cryptographic_message_syntax::SignedData,
    log::{debug, warn},
    plist::{Dictionary, Value},
    std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
        time::SystemTime,
    },
    x509_certificate::CapturedX509Certificate,
};

/// Entitlement holding the application identifier a profile is scoped to.
pub const ENTITLEMENT_APPLICATION_IDENTIFIER: &str = "application-identifier";

/// Entitlement holding the application identifier in macOS profiles.
pub const ENTITLEMENT_APPLE_APPLICATION_IDENTIFIER: &str = "com.apple.application-identifier";

/// Entitlement allowing debuggers to attach to the process.
pub const ENTITLEMENT_GET_TASK_ALLOW: &str = "get-task-allow";

/// The distribution channel a provisioning profile is intended for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProfileKind {
    Development,
    AdHoc,
    AppStore,
}

impl ProfileKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Development => "Development",
            Self::AdHoc => "AdHoc",
            Self::AppStore => "AppStore",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Development => "Deploy via Xcode",
            Self::AdHoc => "Distribute via TestFlight",
            Self::AppStore => "Distribute via App Store",
        }
    }
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Obtain the plist payload from the CMS signed data of a provisioning profile.
///
/// The signature itself is not verified.
pub fn provisioning_profile_payload(data: &[u8]) -> Result<Vec<u8>, AppleProvisioningError> {
    let signed_data = SignedData::parse_ber(data)?;

    signed_data
        .signed_content()
        .map(|content| content.to_vec())
        .ok_or(AppleProvisioningError::ProfileNoContent)
}

/// Compute the uppercase hex SHA-1 fingerprint of a DER encoded X.509 certificate.
pub fn certificate_fingerprint(der: &[u8]) -> Result<String, AppleProvisioningError> {
    let cert = CapturedX509Certificate::from_der(der.to_vec())?;

    let digest = ring::digest::digest(
        &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
        cert.constructed_data(),
    );

    Ok(hex::encode_upper(digest.as_ref()))
}

/// Convert a plist date to a calendar date in the local time zone.
fn local_date(date: &plist::Date) -> NaiveDate {
    DateTime::<Local>::from(SystemTime::from(*date)).date_naive()
}

/// A decoded provisioning profile.
#[derive(Clone, Debug)]
pub struct ProvisioningProfile {
    path: PathBuf,
    name: String,
    uuid: Option<String>,
    app_id_name: Option<String>,
    app_identifier_prefix: Option<String>,
    app_identifier: Option<String>,
    team_identifier: Option<String>,
    team_name: Option<String>,
    platforms: Vec<String>,
    creation_date: Option<NaiveDate>,
    expiration_date: NaiveDate,
    is_xcode_managed: bool,
    developer_certificate_fingerprints: BTreeSet<String>,
    entitlements: Dictionary,
    provisioned_devices: Option<Vec<String>>,
    task_allow: bool,
    time_to_live: Option<u64>,
    version: Option<u64>,
}

impl ProvisioningProfile {
    /// Construct a profile from its essential attributes.
    ///
    /// The application identifier and `get-task-allow` flag are derived from
    /// `entitlements`.
    pub fn new(
        path: impl Into<PathBuf>,
        name: impl ToString,
        app_identifier_prefix: Option<String>,
        entitlements: Dictionary,
        expiration_date: NaiveDate,
    ) -> Self {
        let app_identifier = entitlements
            .get(ENTITLEMENT_APPLICATION_IDENTIFIER)
            .or_else(|| entitlements.get(ENTITLEMENT_APPLE_APPLICATION_IDENTIFIER))
            .and_then(Value::as_string)
            .map(|s| s.to_string());

        let task_allow = entitlements
            .get(ENTITLEMENT_GET_TASK_ALLOW)
            .and_then(Value::as_boolean)
            .unwrap_or(false);

        Self {
            path: path.into(),
            name: name.to_string(),
            uuid: None,
            app_id_name: None,
            app_identifier_prefix,
            app_identifier,
            team_identifier: None,
            team_name: None,
            platforms: vec![],
            creation_date: None,
            expiration_date,
            is_xcode_managed: false,
            developer_certificate_fingerprints: BTreeSet::new(),
            entitlements,
            provisioned_devices: None,
            task_allow,
            time_to_live: None,
            version: None,
        }
    }

    /// Set the fingerprints of developer certificates this profile authorizes.
    pub fn with_developer_certificate_fingerprints(
        mut self,
        fingerprints: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        self.developer_certificate_fingerprints = fingerprints
            .into_iter()
            .map(|fp| fp.as_ref().to_uppercase())
            .collect();
        self
    }

    /// Set the devices this profile may be installed on.
    ///
    /// An empty list is equivalent to no list.
    pub fn with_provisioned_devices(mut self, devices: Vec<String>) -> Self {
        self.provisioned_devices = if devices.is_empty() {
            None
        } else {
            Some(devices)
        };
        self
    }

    /// Construct an instance from the decoded plist payload of a profile.
    pub fn from_plist_value(
        path: impl Into<PathBuf>,
        value: Value,
    ) -> Result<Self, AppleProvisioningError> {
        let path = path.into();
        let decode_error =
            |message: String| AppleProvisioningError::ProfileDecode(path.clone(), message);

        let mut dict = value
            .into_dictionary()
            .ok_or_else(|| decode_error("plist root is not a dictionary".into()))?;

        let name = string_value(&dict, "Name")
            .ok_or_else(|| decode_error("Name key not present".into()))?;
        let expiration_date = dict
            .get("ExpirationDate")
            .and_then(Value::as_date)
            .map(|date| local_date(&date))
            .ok_or_else(|| decode_error("ExpirationDate key not present".into()))?;
        let entitlements = dict
            .remove("Entitlements")
            .and_then(Value::into_dictionary)
            .ok_or_else(|| decode_error("Entitlements dictionary not present".into()))?;

        let fingerprints = match dict.get("DeveloperCertificates") {
            Some(Value::Array(certs)) => certs
                .iter()
                .map(|cert| {
                    let der = cert.as_data().ok_or_else(|| {
                        decode_error("DeveloperCertificates entry is not data".into())
                    })?;

                    certificate_fingerprint(der)
                        .map_err(|e| decode_error(format!("bad developer certificate: {}", e)))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(decode_error(
                    "DeveloperCertificates is not an array".into(),
                ))
            }
            None => vec![],
        };

        let mut profile = Self::new(
            path.clone(),
            name,
            first_string_value(&dict, "ApplicationIdentifierPrefix"),
            entitlements,
            expiration_date,
        )
        .with_developer_certificate_fingerprints(fingerprints)
        .with_provisioned_devices(string_values(&dict, "ProvisionedDevices"));

        profile.uuid = string_value(&dict, "UUID");
        profile.app_id_name = string_value(&dict, "AppIDName");
        profile.team_identifier = first_string_value(&dict, "TeamIdentifier");
        profile.team_name = string_value(&dict, "TeamName");
        profile.platforms = string_values(&dict, "Platform");
        profile.creation_date = dict
            .get("CreationDate")
            .and_then(Value::as_date)
            .map(|date| local_date(&date));
        profile.is_xcode_managed = dict
            .get("IsXcodeManaged")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        profile.time_to_live = dict.get("TimeToLive").and_then(Value::as_unsigned_integer);
        profile.version = dict.get("Version").and_then(Value::as_unsigned_integer);

        Ok(profile)
    }

    /// Construct an instance from plist data (XML or binary).
    pub fn from_plist_data(
        path: impl Into<PathBuf>,
        data: &[u8],
    ) -> Result<Self, AppleProvisioningError> {
        let value = Value::from_reader(std::io::Cursor::new(data))?;

        Self::from_plist_value(path, value)
    }

    /// Construct an instance from the raw, signed content of a provisioning profile file.
    pub fn from_signed_data(
        path: impl Into<PathBuf>,
        data: &[u8],
    ) -> Result<Self, AppleProvisioningError> {
        let payload = provisioning_profile_payload(data)?;

        Self::from_plist_data(path, &payload)
    }

    /// Read and decode a provisioning profile file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AppleProvisioningError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        Self::from_signed_data(path, &data)
    }

    /// Filesystem path this profile was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The profile's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    /// Name of the App ID this profile was created for.
    pub fn app_id_name(&self) -> Option<&str> {
        self.app_id_name.as_deref()
    }

    /// Team-scoped prefix of application identifiers, e.g. `ABCDE12345`.
    pub fn app_identifier_prefix(&self) -> Option<&str> {
        self.app_identifier_prefix.as_deref()
    }

    /// Application identifier pattern, e.g. `ABCDE12345.com.example.*`.
    pub fn app_identifier(&self) -> Option<&str> {
        self.app_identifier.as_deref()
    }

    pub fn team_identifier(&self) -> Option<&str> {
        self.team_identifier.as_deref()
    }

    pub fn team_name(&self) -> Option<&str> {
        self.team_name.as_deref()
    }

    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    pub fn creation_date(&self) -> Option<NaiveDate> {
        self.creation_date
    }

    /// Last calendar date (in local time) on which this profile is valid.
    pub fn expiration_date(&self) -> NaiveDate {
        self.expiration_date
    }

    pub fn is_xcode_managed(&self) -> bool {
        self.is_xcode_managed
    }

    /// SHA-1 fingerprints of the certificates allowed to sign with this profile.
    pub fn developer_certificate_fingerprints(&self) -> &BTreeSet<String> {
        &self.developer_certificate_fingerprints
    }

    /// Entitlements granted by this profile.
    pub fn entitlements(&self) -> &Dictionary {
        &self.entitlements
    }

    /// Devices this profile may be installed on.
    pub fn provisioned_devices(&self) -> Option<&[String]> {
        self.provisioned_devices.as_deref()
    }

    /// Value of the `get-task-allow` entitlement.
    pub fn task_allow(&self) -> bool {
        self.task_allow
    }

    pub fn time_to_live(&self) -> Option<u64> {
        self.time_to_live
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn aps_environment(&self) -> Option<&str> {
        self.entitlements
            .get("aps-environment")
            .and_then(Value::as_string)
    }

    pub fn beta_reports_active(&self) -> bool {
        self.entitlements
            .get("beta-reports-active")
            .and_then(Value::as_boolean)
            .unwrap_or(false)
    }

    /// The distribution channel of this profile.
    pub fn kind(&self) -> ProfileKind {
        if self.task_allow {
            ProfileKind::Development
        } else if self.provisioned_devices.is_some() {
            ProfileKind::AdHoc
        } else {
            ProfileKind::AppStore
        }
    }

    /// Whether this profile's application identifier is exactly `<prefix>.<scope>`.
    ///
    /// The prefix is this profile's own. Profiles without a prefix or application
    /// identifier never match.
    pub fn matches_scope(&self, scope: &str) -> bool {
        match (&self.app_identifier_prefix, &self.app_identifier) {
            (Some(prefix), Some(identifier)) => identifier == &format!("{}.{}", prefix, scope),
            _ => false,
        }
    }

    /// Whether the certificate with the given SHA-1 fingerprint may sign with this profile.
    pub fn authorizes_certificate(&self, fingerprint: &str) -> bool {
        self.developer_certificate_fingerprints
            .contains(&fingerprint.to_uppercase())
    }

    /// Whether this profile has not expired as of `date`.
    ///
    /// A profile expiring on `date` is still valid.
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.expiration_date >= date
    }
}

fn string_value(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key)
        .and_then(Value::as_string)
        .map(|s| s.to_string())
}

fn string_values(dict: &Dictionary, key: &str) -> Vec<String> {
    dict.get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_string)
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn first_string_value(dict: &Dictionary, key: &str) -> Option<String> {
    string_values(dict, key).into_iter().next()
}

/// The provisioning profiles installed on this machine.
///
/// Profiles are sorted case-insensitively by name. Expired profiles are
/// retained in the catalog and excluded at query time.
#[derive(Clone, Debug, Default)]
pub struct ProvisioningProfileCatalog {
    profiles: Vec<ProvisioningProfile>,
}

impl ProvisioningProfileCatalog {
    /// Construct an instance from profiles in arbitrary order.
    pub fn new(profiles: impl IntoIterator<Item = ProvisioningProfile>) -> Self {
        let mut profiles = profiles.into_iter().collect::<Vec<_>>();
        profiles.sort_by_key(|profile| profile.name.to_lowercase());

        Self { profiles }
    }

    /// Load all profiles having the given file extension beneath a directory.
    ///
    /// A missing directory yields an empty catalog. Files that fail to decode
    /// are skipped.
    pub fn load_directory(directory: impl AsRef<Path>, extension: &str) -> Self {
        let directory = directory.as_ref();

        if !directory.is_dir() {
            warn!(
                "provisioning profiles directory {} does not exist",
                directory.display()
            );
            return Self::default();
        }

        let mut profiles = vec![];

        for entry in walkdir::WalkDir::new(directory).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("error reading provisioning profiles directory: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|x| x.to_str()) != Some(extension)
            {
                continue;
            }

            debug!("reading provisioning profile {}", path.display());
            match ProvisioningProfile::from_path(path) {
                Ok(profile) => profiles.push(profile),
                Err(e) => {
                    warn!(
                        "ignoring provisioning profile {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }

        Self::new(profiles)
    }

    /// All profiles, including expired ones.
    pub fn profiles(&self) -> &[ProvisioningProfile] {
        &self.profiles
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Profiles that have not expired as of `date`, in catalog order.
    pub fn valid_profiles_on(&self, date: NaiveDate) -> Vec<&ProvisioningProfile> {
        self.profiles
            .iter()
            .filter(|profile| profile.is_valid_on(date))
            .collect()
    }

    /// Profiles that have not expired as of the current local date.
    pub fn valid_profiles(&self) -> Vec<&ProvisioningProfile> {
        self.valid_profiles_on(Local::now().date_naive())
    }

    /// Find a profile by its name.
    pub fn find_by_name(&self, name: &str) -> Option<&ProvisioningProfile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }
}
