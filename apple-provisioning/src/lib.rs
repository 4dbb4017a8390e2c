// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing identity and provisioning profile resolution for Apple platforms.
//!
//! Before an iOS or macOS application bundle can be signed, somebody has to
//! decide *what* to sign it with: which certificate in the keychain, and which
//! of the many provisioning profiles Xcode has downloaded over the years. This
//! crate makes that decision and then drives Apple's `codesign` tool to carry
//! it out.
//!
//! # How It Works
//!
//! 1. Signing identities are discovered with `security find-identity` and
//!    filtered by name. (See [IdentityCatalog].)
//! 2. Provisioning profiles are decoded from
//!    `~/Library/MobileDevice/Provisioning Profiles`. Expired profiles are
//!    ignored. (See [ProvisioningProfileCatalog].)
//! 3. The application's bundle identifier is matched against the profiles,
//!    generalizing it towards wildcard application identifiers until a
//!    profile authorizing one of the identities is found. (See
//!    [ProfileResolver].)
//! 4. Entitlements are composed from a template and the profile's
//!    entitlements. (See [EntitlementsComposer].)
//! 5. `codesign` signs the bundle and `codesign --verify` confirms the
//!    result. A locked keychain is unlocked once on demand. (See
//!    [SigningExecutor].)
//!
//! [SigningSession] runs all of the above for a bundle or disk image.
//!
//! # Platform Support
//!
//! Profile decoding and resolution work on any platform. Signing requires
//! Apple's command line tools and therefore macOS.
//!
//! Signatures of provisioning profiles are not verified: their payload is
//! extracted and trusted as-is.

mod entitlements;
pub use entitlements::*;
mod error;
pub use error::*;
mod executor;
pub use executor::*;
mod identity;
pub use identity::*;
mod platform;
pub use platform::*;
mod profile;
pub use profile::*;
mod resolver;
pub use resolver::*;
mod session;
pub use session::*;
mod settings;
pub use settings::*;
mod tools;
pub use tools::*;

#[cfg(test)]
mod testutil;
