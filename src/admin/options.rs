use std::fs;
use std::path::Path;

use crate::db::StoreOptions;

use crate::admin::Result;

/// Common options used when opening a store for administrative commands.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Store configuration.
    pub store: StoreOptions,
    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            store: StoreOptions::default(),
            create_if_missing: false,
        }
    }
}

impl AdminOpenOptions {
    /// Loads store options from a TOML file.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self {
            store: StoreOptions::from_toml_str(&text)?,
            ..Self::default()
        })
    }

    /// Options actually handed to the store. Admin commands never run the
    /// background checkpointer.
    pub(crate) fn store_options(&self, readonly: bool) -> StoreOptions {
        StoreOptions {
            create_if_missing: self.create_if_missing,
            checkpoint_interval: 0,
            readonly: readonly || self.store.readonly,
            ..self.store.clone()
        }
    }
}
