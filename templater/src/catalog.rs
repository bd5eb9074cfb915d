use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::LazyLock,
};
use tracing::{debug, error};
use url::Url;
use validator::{Validate, ValidationError};

use crate::{document::DocumentPath, fetch::Checksum};

/// Proxmox guest names must be valid DNS names.
static VM_NAME: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.-]{0,61}[A-Za-z0-9])?$").expect("valid regex")
});

/// A provisionable cloud image.
#[derive(Clone, Serialize, Deserialize, Validate, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Where the image is downloaded from (http, https, or file)
    pub url: Url,

    /// Local file name for the download
    #[validate(custom(function = "validate_filename"))]
    pub filename: String,

    /// Template id on the host
    #[validate(range(min = 100, max = 999_999_999))]
    pub vm_id: u32,

    /// Template name on the host
    #[validate(custom(function = "validate_vm_name"))]
    pub vm_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// A hash of the image, e.g. "sha256:..."
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
}

/// All known images by name. Loaded once and never modified.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,

    /// Entries present in the document that could not be read, with the reason
    rejected: BTreeMap<String, String>,
}

impl Catalog {
    /// Load the catalog document. A missing or malformed document is reported
    /// and results in an empty catalog. Each entry is read on its own so one
    /// bad entry only rejects itself.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let document = DocumentPath::new(path);

        if !document.exists() {
            error!(path = %document, "Templates file not found");
            return Self::default();
        }

        let raw = match document.load::<BTreeMap<String, serde_json::Value>>() {
            Ok(raw) => raw,
            Err(error) => {
                error!(path = %document, error = ?error, "Failed to load templates");
                return Self::default();
            }
        };

        let mut catalog = Self::default();
        for (name, value) in raw {
            match serde_json::from_value::<CatalogEntry>(value) {
                Ok(entry) => {
                    catalog.entries.insert(name, entry);
                }
                Err(error) => {
                    error!(path = %document, image = name.as_str(), error = %error, "Invalid template entry");
                    catalog.rejected.insert(name, error.to_string());
                }
            }
        }

        debug!(
            path = %document,
            count = catalog.entries.len(),
            rejected = catalog.rejected.len(),
            "Loaded templates"
        );
        catalog
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, CatalogEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            rejected: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    /// Why the named entry could not be read, if it was rejected.
    pub fn rejection(&self, name: &str) -> Option<&str> {
        self.rejected.get(name).map(String::as_str)
    }

    /// Every name in the document, readable or not.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .keys()
            .chain(self.rejected.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Readable entries only.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &CatalogEntry)> {
        self.entries.iter()
    }

    pub fn rejected(&self) -> impl Iterator<Item = (&String, &String)> {
        self.rejected.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// VM ids claimed by more than one entry, with the entries claiming them.
    pub fn duplicate_vm_ids(&self) -> BTreeMap<u32, Vec<String>> {
        let mut by_id: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for (name, entry) in &self.entries {
            by_id.entry(entry.vm_id).or_default().push(name.clone());
        }
        by_id.retain(|_, names| names.len() > 1);
        by_id
    }
}

fn validate_filename(filename: &str) -> Result<(), ValidationError> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
    {
        return Err(ValidationError::new("Filename must be a plain file name"));
    }
    Ok(())
}

fn validate_vm_name(name: &str) -> Result<(), ValidationError> {
    if VM_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::new("VM name must be a valid DNS name"))
    }
}
