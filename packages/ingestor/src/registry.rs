//! Platform Registry
//!
//! Maps known contract addresses to the category and platform they belong to.
//! The table is data, not code: a versioned JSON document, with a built-in
//! copy compiled into the binary and an optional file override at start-up.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Registry document compiled into the binary
pub const BUILTIN_REGISTRY_JSON: &str = include_str!("../registry/platforms.json");

/// Highest registry document version this build understands
pub const SUPPORTED_REGISTRY_VERSION: u32 = 1;

/// Errors that can occur while loading a registry document
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to read registry file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse registry: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported registry version {0} (max supported {1})")]
    UnsupportedVersion(u32, u32),

    #[error("Duplicate contract address: {0}")]
    DuplicateAddress(String),

    #[error("Empty platform name for contract {0}")]
    EmptyPlatform(String),
}

/// The closed set of platform categories.
///
/// A category decides both the ledger table a credit lands in and the rule
/// used to turn a transaction into points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Dex,
    Lsd,
    Launchpad,
    Gamefi,
    Socialfi,
    Nft,
}

impl Category {
    /// Every category, in ledger table order
    pub const ALL: [Category; 6] = [
        Category::Dex,
        Category::Lsd,
        Category::Launchpad,
        Category::Gamefi,
        Category::Socialfi,
        Category::Nft,
    ];

    /// Lower-case category name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Category::Dex => "dex",
            Category::Lsd => "lsd",
            Category::Launchpad => "launchpad",
            Category::Gamefi => "gamefi",
            Category::Socialfi => "socialfi",
            Category::Nft => "nft",
        }
    }

    /// Ledger table holding this category's rows
    pub fn table_name(&self) -> &'static str {
        self.name()
    }

    /// Whether points scale with the transferred native value.
    ///
    /// Value-scaled categories skip zero-value calls; the rest earn a flat
    /// point per matching transaction.
    pub fn is_value_scaled(&self) -> bool {
        matches!(self, Category::Dex | Category::Lsd)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a string is not one of the known categories
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown category: {0:?}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    /// Case-insensitive, surrounding whitespace ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.name() == normalized)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// What a registered contract resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub category: Category,
    pub platform: String,
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    version: u32,
    #[serde(default)]
    name: Option<String>,
    contracts: Vec<ContractEntry>,
}

#[derive(Debug, Deserialize)]
struct ContractEntry {
    address: String,
    category: Category,
    platform: String,
}

/// Immutable address → (category, platform) table
#[derive(Debug, Clone)]
pub struct PlatformRegistry {
    version: u32,
    name: Option<String>,
    contracts: HashMap<String, PlatformInfo>,
}

static BUILTIN: LazyLock<PlatformRegistry> = LazyLock::new(|| {
    PlatformRegistry::from_json(BUILTIN_REGISTRY_JSON).expect("built-in registry must be valid")
});

impl PlatformRegistry {
    /// The registry compiled into this binary
    pub fn builtin() -> &'static PlatformRegistry {
        &BUILTIN
    }

    /// Parse a registry document
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let doc: RegistryDocument = serde_json::from_str(json)?;
        if doc.version > SUPPORTED_REGISTRY_VERSION {
            return Err(RegistryError::UnsupportedVersion(
                doc.version,
                SUPPORTED_REGISTRY_VERSION,
            ));
        }

        let mut contracts = HashMap::with_capacity(doc.contracts.len());
        for entry in doc.contracts {
            let key = entry.address.trim().to_lowercase();
            if entry.platform.trim().is_empty() {
                return Err(RegistryError::EmptyPlatform(entry.address));
            }
            if !is_well_formed_address(&key) {
                // Kept as-is: it can never match a real recipient, but the
                // document is still usable.
                warn!(
                    "Registry entry '{}' ({}) is not a 20-byte hex address",
                    entry.address, entry.platform
                );
            }
            let info = PlatformInfo {
                category: entry.category,
                platform: entry.platform,
            };
            if contracts.insert(key, info).is_some() {
                return Err(RegistryError::DuplicateAddress(entry.address));
            }
        }

        Ok(Self {
            version: doc.version,
            name: doc.name,
            contracts,
        })
    }

    /// Load a registry document from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let registry = Self::from_json(&json)?;
        info!(
            "Loaded registry {} v{} with {} contracts from {}",
            registry.name().unwrap_or("<unnamed>"),
            registry.version,
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Look up a recipient address, ignoring letter case
    pub fn lookup(&self, address: &str) -> Option<&PlatformInfo> {
        self.contracts.get(&address.to_lowercase())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Iterate over (lower-case address, info) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PlatformInfo)> {
        self.contracts.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Check that a string is a 0x-prefixed 20-byte hex address
pub fn is_well_formed_address(address: &str) -> bool {
    let Some(digits) = address.strip_prefix("0x") else {
        return false;
    };
    matches!(hex::decode(digits), Ok(bytes) if bytes.len() == 20)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KURU: &str = "0xc816865f172d640d93712C68a7E1F83F3fA63235";
    const EXOGAME: &str = "0x1E134586bc39987fb38515147EE3c5ef20D4895f";

    // ==================== Category tests ====================

    #[test]
    fn test_category_names() {
        assert_eq!(Category::Dex.name(), "dex");
        assert_eq!(Category::Lsd.name(), "lsd");
        assert_eq!(Category::Launchpad.name(), "launchpad");
        assert_eq!(Category::Gamefi.name(), "gamefi");
        assert_eq!(Category::Socialfi.name(), "socialfi");
        assert_eq!(Category::Nft.name(), "nft");
    }

    #[test]
    fn test_category_from_str_is_case_insensitive() {
        assert_eq!("DEX".parse::<Category>(), Ok(Category::Dex));
        assert_eq!(" Lsd ".parse::<Category>(), Ok(Category::Lsd));
        assert_eq!("socialFi".parse::<Category>(), Ok(Category::Socialfi));
    }

    #[test]
    fn test_category_from_str_rejects_unknown() {
        assert!("defi".parse::<Category>().is_err());
        assert!("".parse::<Category>().is_err());
        assert!("dex; DROP TABLE dex".parse::<Category>().is_err());
    }

    #[test]
    fn test_only_dex_and_lsd_are_value_scaled() {
        let scaled: Vec<_> = Category::ALL.into_iter().filter(Category::is_value_scaled).collect();
        assert_eq!(scaled, vec![Category::Dex, Category::Lsd]);
    }

    #[test]
    fn test_category_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&Category::Gamefi).unwrap(), "\"gamefi\"");
        let parsed: Category = serde_json::from_str("\"nft\"").unwrap();
        assert_eq!(parsed, Category::Nft);
    }

    // ==================== Built-in registry tests ====================

    #[test]
    fn test_builtin_registry_loads() {
        let registry = PlatformRegistry::builtin();
        assert_eq!(registry.len(), 15);
        assert_eq!(registry.version(), 1);
        assert_eq!(registry.name(), Some("monad-testnet"));
    }

    #[test]
    fn test_builtin_lookup_dex() {
        let info = PlatformRegistry::builtin().lookup(KURU).unwrap();
        assert_eq!(info.category, Category::Dex);
        assert_eq!(info.platform, "kuru");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = PlatformRegistry::builtin();
        let lower = registry.lookup(&EXOGAME.to_lowercase()).unwrap();
        let upper = registry.lookup(&EXOGAME.to_uppercase().replacen("0X", "0x", 1)).unwrap();
        let mixed = registry.lookup(EXOGAME).unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, mixed);
        assert_eq!(lower.category, Category::Nft);
    }

    #[test]
    fn test_lookup_unknown_returns_none() {
        let registry = PlatformRegistry::builtin();
        assert!(registry.lookup("0x0000000000000000000000000000000000000000").is_none());
        assert!(registry.lookup("").is_none());
    }

    #[test]
    fn test_builtin_covers_every_category() {
        let registry = PlatformRegistry::builtin();
        for category in Category::ALL {
            assert!(
                registry.iter().any(|(_, info)| info.category == category),
                "no contract for {}",
                category
            );
        }
    }

    #[test]
    fn test_builtin_keys_are_lowercase() {
        for (address, _) in PlatformRegistry::builtin().iter() {
            assert_eq!(address, address.to_lowercase());
        }
    }

    // ==================== Document loading tests ====================

    #[test]
    fn test_from_json_rejects_duplicate_addresses_ignoring_case() {
        let json = r#"{
            "version": 1,
            "contracts": [
                { "address": "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", "category": "dex", "platform": "a" },
                { "address": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "category": "nft", "platform": "b" }
            ]
        }"#;
        let result = PlatformRegistry::from_json(json);
        assert!(matches!(result, Err(RegistryError::DuplicateAddress(_))));
    }

    #[test]
    fn test_from_json_rejects_unknown_category() {
        let json = r#"{
            "version": 1,
            "contracts": [
                { "address": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "category": "bridge", "platform": "a" }
            ]
        }"#;
        assert!(matches!(PlatformRegistry::from_json(json), Err(RegistryError::Parse(_))));
    }

    #[test]
    fn test_from_json_rejects_future_version() {
        let json = r#"{ "version": 2, "contracts": [] }"#;
        let result = PlatformRegistry::from_json(json);
        assert!(matches!(result, Err(RegistryError::UnsupportedVersion(2, 1))));
    }

    #[test]
    fn test_from_json_rejects_empty_platform() {
        let json = r#"{
            "version": 1,
            "contracts": [
                { "address": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "category": "dex", "platform": "  " }
            ]
        }"#;
        assert!(matches!(PlatformRegistry::from_json(json), Err(RegistryError::EmptyPlatform(_))));
    }

    #[test]
    fn test_from_json_keeps_malformed_address() {
        // The short deepdrop address in the built-in document is such a case.
        let registry = PlatformRegistry::builtin();
        let info = registry.lookup("0xE2d7A1b5B3CF72A96489926df21d4895f").unwrap();
        assert_eq!(info.platform, "deepdrop");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            r#"{ "version": 1, "name": "local", "contracts": [
                { "address": "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", "category": "gamefi", "platform": "chess" }
            ] }"#,
        )
        .unwrap();

        let registry = PlatformRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.name(), Some("local"));
        assert_eq!(
            registry.lookup("0xBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB").unwrap().category,
            Category::Gamefi
        );
    }

    #[test]
    fn test_load_missing_file() {
        let result = PlatformRegistry::load("/nonexistent/registry.json");
        assert!(matches!(result, Err(RegistryError::Io { .. })));
    }

    // ==================== Address validation tests ====================

    #[test]
    fn test_is_well_formed_address() {
        assert!(is_well_formed_address("0xc816865f172d640d93712c68a7e1f83f3fa63235"));
        assert!(!is_well_formed_address("c816865f172d640d93712c68a7e1f83f3fa63235"));
        assert!(!is_well_formed_address("0xe2d7a1b5b3cf72a96489926df21d4895f"));
        assert!(!is_well_formed_address("0xzz16865f172d640d93712c68a7e1f83f3fa63235"));
        assert!(!is_well_formed_address(""));
    }
}
