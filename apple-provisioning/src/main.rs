// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apple_provisioning::{
        AppleProvisioningError, ApplePlatform, ProvisioningProfile, SigningCapabilities,
        SigningPurpose, SigningSession, SigningSettings, SystemSigningTools,
    },
    chrono::Local,
    clap::{Arg, ArgMatches, Command},
    log::{warn, LevelFilter},
    std::path::Path,
};

const LIST_PROFILES_ABOUT: &str = "\
List installed provisioning profiles.

Provisioning profiles are read from the directory Xcode installs them to
(~/Library/MobileDevice/Provisioning Profiles) unless --profiles-dir is given.
Only profiles for the selected --platform are shown. Expired profiles are
hidden unless --all is given.
";

const RESOLVE_ABOUT: &str = "\
Resolve the signing identity and provisioning profile for a bundle identifier.

Signing identities in the keychain are tried in alphabetical order. For each
identity, provisioning profiles are searched for one whose application
identifier covers the bundle identifier and which authorizes the identity's
certificate.

On iOS, if no profile covers the bundle identifier exactly, it is generalized
into wildcard scopes. e.g. for com.example.app, the scopes com.example.app,
com.example.*, com.* and * are tried in that order.

Nothing is modified by this command.
";

const SIGN_ABOUT: &str = "\
Sign an application bundle.

The bundle identifier is read from the bundle's Info.plist unless --bundle-id
is given. A signing identity and provisioning profile are resolved (see the
`resolve` command), the provisioning profile is embedded in the bundle,
entitlements are composed, and `codesign` is invoked. The result is verified
with `codesign --verify`.

If the keychain holding the signing key is locked, you will be prompted to
unlock it.
";

const SIGN_DMG_ABOUT: &str = "\
Sign a disk image.

Disk images are always signed with macOS identities; --platform is ignored.
A `Developer ID Application` identity is preferred if one is available, since
only those signatures can be notarized.
";

fn add_settings_args(app: Command) -> Command {
    app.arg(
        Arg::new("platform")
            .long("platform")
            .takes_value(true)
            .global(true)
            .possible_values(&["ios", "macos"])
            .default_value("ios")
            .help("Apple platform being signed for"),
    )
    .arg(
        Arg::new("config")
            .long("config")
            .takes_value(true)
            .global(true)
            .help("Path to a JSON file defining signing settings"),
    )
    .arg(
        Arg::new("identity")
            .long("identity")
            .takes_value(true)
            .global(true)
            .help("Exact name of the signing identity to use"),
    )
    .arg(
        Arg::new("identity_user_name")
            .long("identity-user-name")
            .takes_value(true)
            .global(true)
            .help("Only consider identities whose name contains this value"),
    )
    .arg(
        Arg::new("provisioning_profile")
            .long("provisioning-profile")
            .takes_value(true)
            .global(true)
            .help("Name of the provisioning profile to use"),
    )
    .arg(
        Arg::new("profiles_dir")
            .long("profiles-dir")
            .takes_value(true)
            .global(true)
            .help("Directory to load provisioning profiles from"),
    )
    .arg(
        Arg::new("purpose")
            .long("purpose")
            .takes_value(true)
            .global(true)
            .possible_values(&["development", "distribution"])
            .help("What the signed application is for (controls get-task-allow)"),
    )
    .arg(
        Arg::new("app_store")
            .long("app-store")
            .global(true)
            .help("Sign for Mac App Store submission"),
    )
    .arg(
        Arg::new("entitlements")
            .long("entitlements")
            .takes_value(true)
            .global(true)
            .help("Path to an entitlements plist to use as template"),
    )
    .arg(
        Arg::new("work_dir")
            .long("work-dir")
            .takes_value(true)
            .global(true)
            .help("Directory to write the composed entitlements to"),
    )
    .arg(
        Arg::new("codesign_verbose")
            .long("codesign-verbose")
            .global(true)
            .help("Pass --verbose to codesign"),
    )
}

fn settings_from_args(args: &ArgMatches) -> Result<SigningSettings, AppleProvisioningError> {
    let mut settings = if let Some(path) = args.value_of("config") {
        SigningSettings::from_json_file(path)?
    } else {
        SigningSettings::default()
    };

    if let Some(value) = args.value_of("identity") {
        settings.set_identity(value);
    }
    if let Some(value) = args.value_of("identity_user_name") {
        settings.set_identity_user_name(value);
    }
    if let Some(value) = args.value_of("provisioning_profile") {
        settings.set_provisioning_profile(value);
    }
    if let Some(value) = args.value_of("profiles_dir") {
        settings.set_provisioning_profiles_directory(value);
    }
    if let Some(value) = args.value_of("purpose") {
        settings.set_purpose(
            SigningPurpose::try_from(value).map_err(AppleProvisioningError::CliGeneralError)?,
        );
    }
    if args.is_present("app_store") {
        settings.set_app_store(true);
    }
    if let Some(value) = args.value_of("entitlements") {
        settings.set_entitlements_template(value);
    }
    if let Some(value) = args.value_of("work_dir") {
        settings.set_work_directory(value);
    }
    if args.is_present("codesign_verbose") {
        settings.set_verbose(true);
    }

    Ok(settings)
}

fn session_from_args(
    args: &ArgMatches,
) -> Result<SigningSession<SystemSigningTools>, AppleProvisioningError> {
    let platform = ApplePlatform::try_from(
        args.value_of("platform")
            .ok_or(AppleProvisioningError::CliBadArgument)?,
    )
    .map_err(AppleProvisioningError::CliGeneralError)?;

    session_for_platform(args, platform)
}

fn session_for_platform(
    args: &ArgMatches,
    platform: ApplePlatform,
) -> Result<SigningSession<SystemSigningTools>, AppleProvisioningError> {
    Ok(SigningSession::new(
        SystemSigningTools::default(),
        SigningCapabilities::for_platform(platform),
        settings_from_args(args)?,
    ))
}

/// Disk images only exist on macOS, whatever --platform says.
fn disk_image_session_from_args(
    args: &ArgMatches,
) -> Result<SigningSession<SystemSigningTools>, AppleProvisioningError> {
    session_for_platform(args, ApplePlatform::MacOs)
}

fn print_profile(profile: &ProvisioningProfile, expired: bool) {
    println!("{}", profile.name());
    println!("  path: {}", profile.path().display());
    if let Some(uuid) = profile.uuid() {
        println!("  uuid: {}", uuid);
    }
    println!(
        "  application identifier: {}",
        profile.app_identifier().unwrap_or("(none)")
    );
    if let Some(team) = profile.team_name() {
        println!(
            "  team: {} ({})",
            team,
            profile.team_identifier().unwrap_or_default()
        );
    }
    println!(
        "  kind: {} ({})",
        profile.kind(),
        profile.kind().description()
    );
    println!(
        "  expires: {}{}",
        profile.expiration_date(),
        if expired { " (expired)" } else { "" }
    );
    for fingerprint in profile.developer_certificate_fingerprints() {
        println!("  certificate: {}", fingerprint);
    }
    if let Some(devices) = profile.provisioned_devices() {
        println!("  devices: {}", devices.len());
    }
}

fn profile_json(profile: &ProvisioningProfile, expired: bool) -> serde_json::Value {
    serde_json::json!({
        "name": profile.name(),
        "path": profile.path(),
        "uuid": profile.uuid(),
        "app_id_name": profile.app_id_name(),
        "app_identifier_prefix": profile.app_identifier_prefix(),
        "app_identifier": profile.app_identifier(),
        "team_identifier": profile.team_identifier(),
        "team_name": profile.team_name(),
        "platforms": profile.platforms(),
        "kind": profile.kind().name(),
        "creation_date": profile.creation_date().map(|d| d.to_string()),
        "expiration_date": profile.expiration_date().to_string(),
        "expired": expired,
        "xcode_managed": profile.is_xcode_managed(),
        "task_allow": profile.task_allow(),
        "developer_certificates": profile.developer_certificate_fingerprints(),
        "provisioned_devices": profile.provisioned_devices(),
    })
}

fn command_list_identities(args: &ArgMatches) -> Result<(), AppleProvisioningError> {
    let session = session_from_args(args)?;

    let identities = if args.is_present("all") {
        session.identity_catalog().identities().iter().collect::<Vec<_>>()
    } else {
        session
            .identity_catalog()
            .select(session.settings(), session.capabilities())?
    };

    if args.is_present("json") {
        println!("{}", serde_json::to_string_pretty(&identities)?);
    } else {
        for identity in &identities {
            println!("{}\t{}", identity.fingerprint(), identity.common_name());
        }
    }

    Ok(())
}

fn command_list_profiles(args: &ArgMatches) -> Result<(), AppleProvisioningError> {
    let session = session_from_args(args)?;
    let today = Local::now().date_naive();

    let profiles = session
        .profile_catalog()
        .profiles()
        .iter()
        .map(|profile| (profile, !profile.is_valid_on(today)))
        .filter(|(_, expired)| args.is_present("all") || !expired)
        .collect::<Vec<_>>();

    if args.is_present("json") {
        let value = profiles
            .iter()
            .map(|(profile, expired)| profile_json(profile, *expired))
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for (profile, expired) in profiles {
            print_profile(profile, expired);
        }
    }

    Ok(())
}

fn command_resolve(args: &ArgMatches) -> Result<(), AppleProvisioningError> {
    let bundle_id = args
        .value_of("bundle_id")
        .ok_or(AppleProvisioningError::CliBadArgument)?;

    let session = session_from_args(args)?;
    let resolution = session.resolve(bundle_id)?;

    println!(
        "identity: {} ({})",
        resolution.identity().common_name(),
        resolution.identity().fingerprint()
    );
    println!("provisioning profile: {}", resolution.profile().name());
    println!("  path: {}", resolution.profile().path().display());
    println!(
        "  application identifier: {}",
        resolution.profile().app_identifier().unwrap_or_default()
    );
    println!("  kind: {}", resolution.profile().kind());

    Ok(())
}

fn command_sign(args: &ArgMatches) -> Result<(), AppleProvisioningError> {
    let path = args
        .value_of("path")
        .ok_or(AppleProvisioningError::CliBadArgument)?;

    let session = session_from_args(args)?;
    let signed = session.sign_app(Path::new(path), args.value_of("bundle_id"))?;

    warn!(
        "signed {} ({}) with {}",
        path, signed.bundle_id, signed.identity
    );
    if let Some(profile) = &signed.profile {
        warn!("embedded provisioning profile {}", profile.name());
    }

    Ok(())
}

fn command_sign_dmg(args: &ArgMatches) -> Result<(), AppleProvisioningError> {
    let path = args
        .value_of("path")
        .ok_or(AppleProvisioningError::CliBadArgument)?;

    let session = disk_image_session_from_args(args)?;
    session.sign_disk_image(Path::new(path))?;

    warn!("signed {}", path);

    Ok(())
}

fn command_verify(args: &ArgMatches) -> Result<(), AppleProvisioningError> {
    let path = args
        .value_of("path")
        .ok_or(AppleProvisioningError::CliBadArgument)?;

    let session = session_from_args(args)?;
    let output = session.verify(Path::new(path))?;

    print!("{}", output.output);

    Ok(())
}

fn build_cli() -> Command<'static> {
    let app = Command::new("Apple signing identity and provisioning profile resolution")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Resolve signing identities and provisioning profiles and sign Apple application bundles")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = add_settings_args(app);

    let app = app.subcommand(
        Command::new("list-identities")
            .about("List code signing identities in the keychain")
            .arg(
                Arg::new("all")
                    .long("all")
                    .help("Show all identities instead of those eligible for the platform"),
            )
            .arg(Arg::new("json").long("json").help("Print JSON")),
    );

    let app = app.subcommand(
        Command::new("list-profiles")
            .about("List installed provisioning profiles")
            .long_about(LIST_PROFILES_ABOUT)
            .arg(
                Arg::new("all")
                    .long("all")
                    .help("Include expired provisioning profiles"),
            )
            .arg(Arg::new("json").long("json").help("Print JSON")),
    );

    let app = app.subcommand(
        Command::new("resolve")
            .about("Resolve the signing identity and provisioning profile for a bundle identifier")
            .long_about(RESOLVE_ABOUT)
            .arg(
                Arg::new("bundle_id")
                    .required(true)
                    .help("Bundle identifier to resolve"),
            ),
    );

    let app = app.subcommand(
        Command::new("sign")
            .about("Sign an application bundle")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("bundle_id")
                    .long("bundle-id")
                    .takes_value(true)
                    .help("Bundle identifier to use instead of the one in Info.plist"),
            )
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the application bundle to sign"),
            ),
    );

    let app = app.subcommand(
        Command::new("sign-dmg")
            .about("Sign a disk image")
            .long_about(SIGN_DMG_ABOUT)
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the disk image to sign"),
            ),
    );

    let app = app.subcommand(
        Command::new("verify")
            .about("Verify the code signature of a path with codesign")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the bundle or disk image to verify"),
            ),
    );

    app
}

fn main_impl() -> Result<(), AppleProvisioningError> {
    let matches = build_cli().get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("list-identities", args)) => command_list_identities(args),
        Some(("list-profiles", args)) => command_list_profiles(args),
        Some(("resolve", args)) => command_resolve(args),
        Some(("sign", args)) => command_sign(args),
        Some(("sign-dmg", args)) => command_sign_dmg(args),
        Some(("verify", args)) => command_verify(args),
        _ => Err(AppleProvisioningError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            if let Some(output) = err.captured_output() {
                if !output.is_empty() {
                    eprintln!("{}", output.trim_end());
                }
            }
            1
        }
    };

    std::process::exit(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition() {
        build_cli().debug_assert();
    }

    #[test]
    fn sign_dmg_uses_macos_identities() -> Result<(), AppleProvisioningError> {
        let matches = build_cli().get_matches_from(vec!["rprovision", "sign-dmg", "App.dmg"]);
        let args = matches
            .subcommand_matches("sign-dmg")
            .ok_or(AppleProvisioningError::CliBadArgument)?;
        assert_eq!(args.value_of("platform"), Some("ios"));

        let session = disk_image_session_from_args(args)?;
        assert_eq!(session.capabilities().platform, ApplePlatform::MacOs);
        assert!(session
            .capabilities()
            .identity_pattern
            .contains("Developer ID Application"));

        let session = session_from_args(args)?;
        assert_eq!(session.capabilities().platform, ApplePlatform::Ios);

        Ok(())
    }
}
