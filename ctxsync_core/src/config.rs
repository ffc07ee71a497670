//! Configuration file support for ctxsync
//!
//! The hardware capability descriptor and the command-stream schema are
//! loaded together from a TOML or YAML file. Every field has a default, so a
//! file only needs to name what differs for its device family.

use crate::context::ContextFields;
use crate::error::{SyncError, SyncResult};
use ctxsync_types::{BitField, CommandSchema, HardwareParams, PortMask};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Capability descriptor of the target device family
    pub hardware: HardwareParams,
    /// Bit layout of the scheduler command stream
    pub schema: CommandSchema,
}

impl SyncConfig {
    /// Load config from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let extension = path.extension().and_then(|s| s.to_str());
        let config = match extension {
            Some("toml") => Self::from_toml(&contents)?,
            Some("yaml") | Some("yml") => Self::from_yaml(&contents)?,
            _ => Self::from_toml(&contents).or_else(|_| Self::from_yaml(&contents))?,
        };
        log::debug!("Loaded ctxsync config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate config from a TOML string
    pub fn from_toml(contents: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate config from a YAML string
    pub fn from_yaml(contents: &str) -> SyncResult<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> SyncResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Find and load config file from standard search paths
    ///
    /// Search order:
    /// 1. ./ctxsync.toml or ./ctxsync.yaml
    /// 2. ~/.ctxsync/config.toml or ~/.ctxsync/config.yaml
    /// 3. /etc/ctxsync/config.toml or /etc/ctxsync/config.yaml
    pub fn find_and_load() -> SyncResult<Self> {
        for path in Self::get_search_paths() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        Err(SyncError::not_found(
            "No ctxsync config file found in standard locations",
        ))
    }

    /// Like [`find_and_load`](Self::find_and_load), falling back to defaults
    pub fn load_or_default() -> SyncResult<Self> {
        match Self::find_and_load() {
            Err(SyncError::NotFound(_)) => {
                log::info!("No ctxsync config file found, using built-in defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Standard config file search paths
    pub fn get_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("ctxsync.toml"),
            PathBuf::from("ctxsync.yaml"),
            PathBuf::from("ctxsync.yml"),
        ];

        if let Some(home) = dirs::home_dir() {
            let dir = home.join(".ctxsync");
            paths.push(dir.join("config.toml"));
            paths.push(dir.join("config.yaml"));
        }

        paths.push(PathBuf::from("/etc/ctxsync/config.toml"));
        paths.push(PathBuf::from("/etc/ctxsync/config.yaml"));
        paths
    }

    /// Check that the schema can encode everything the hardware parameters
    /// allow, and that the parameters describe a usable device.
    pub fn validate(&self) -> SyncResult<()> {
        let hw = &self.hardware;
        let schema = &self.schema;

        if hw.dword_bytes != 4 {
            return Err(SyncError::config(format!(
                "dword_bytes must be 4, got {}",
                hw.dword_bytes
            )));
        }
        if hw.max_ports == 0 || hw.max_ports > PortMask::MAX_PORTS {
            return Err(SyncError::config(format!(
                "max_ports must be in 1..={}, got {}",
                PortMask::MAX_PORTS,
                hw.max_ports
            )));
        }
        if hw.max_payload_dwords_per_record == 0 {
            return Err(SyncError::config(
                "max_payload_dwords_per_record must be at least 1",
            ));
        }
        if hw.context_slot_capacity == 0 {
            return Err(SyncError::config("context_slot_capacity must be at least 1"));
        }
        if hw.lru_growth_increment == 0 {
            return Err(SyncError::config("lru_growth_increment must be at least 1"));
        }
        if hw.total_contexts() == 0 {
            return Err(SyncError::config("at least one collective context is required"));
        }
        if hw.command_body_budget() < hw.max_record_dwords() {
            return Err(SyncError::config(format!(
                "max_command_dwords {} leaves {} dwords after header and reserve, \
                 a record needs up to {}",
                hw.max_command_dwords,
                hw.command_body_budget(),
                hw.max_record_dwords()
            )));
        }

        // header plus every base field, the size of a context reset
        let context_update_dwords = 1 + ContextFields::BASE.count();
        if hw.max_command_dwords < context_update_dwords {
            return Err(SyncError::config(format!(
                "max_command_dwords {} cannot hold a context update of {} dwords",
                hw.max_command_dwords, context_update_dwords
            )));
        }

        for (word, fields) in schema.word_layouts() {
            for (i, (name, field)) in fields.iter().enumerate() {
                if !field.fits_in_dword() {
                    return Err(SyncError::config(format!(
                        "{}.{} does not fit in a 32-bit word",
                        word, name
                    )));
                }
                for (other_name, other) in &fields[i + 1..] {
                    if field.overlaps(other) {
                        return Err(SyncError::config(format!(
                            "{}.{} overlaps {}.{}",
                            word, name, word, other_name
                        )));
                    }
                }
            }
        }

        let requirements: [(&str, BitField, u64); 12] = [
            (
                "command.opcode",
                schema.command.opcode,
                schema.opcodes.context_update.max(schema.opcodes.nic_passthrough) as u64,
            ),
            (
                "command.body_dwords",
                schema.command.body_dwords,
                (hw.max_command_dwords - 1) as u64,
            ),
            (
                "context_update.ctx_index",
                schema.context_update.ctx_index,
                (hw.total_contexts() - 1) as u64,
            ),
            (
                "context_update.field_mask",
                schema.context_update.field_mask,
                ContextFields::all().bits() as u64,
            ),
            (
                "context_update.comm_slot",
                schema.context_update.comm_slot,
                (hw.context_slot_capacity - 1) as u64,
            ),
            ("context_update.sync_slot", schema.context_update.sync_slot, 1),
            (
                "record.dup_mask",
                schema.record.dup_mask,
                PortMask::first(hw.max_ports).bits(),
            ),
            (
                "record.payload_len",
                schema.record.payload_len,
                hw.max_payload_dwords_per_record as u64,
            ),
            ("record.nop", schema.record.nop, 1),
            ("record.credits", schema.record.credits, 1),
            (
                "port_update.ctx_index",
                schema.port_update.ctx_index,
                (hw.total_contexts() - 1) as u64,
            ),
            (
                "port_update.comm_slot",
                schema.port_update.comm_slot,
                (hw.context_slot_capacity - 1) as u64,
            ),
        ];
        for (name, field, needed) in requirements {
            if field.pack(needed).is_none() {
                return Err(SyncError::config(format!(
                    "{} ({} bits) cannot hold {}",
                    name, field.width, needed
                )));
            }
        }
        if schema
            .port_update
            .field
            .pack(ContextFields::all().bits() as u64)
            .is_none()
        {
            return Err(SyncError::config(
                "port_update.field cannot hold the context field mask",
            ));
        }

        Ok(())
    }
}
