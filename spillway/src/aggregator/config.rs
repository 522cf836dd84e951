//! Configuration of the aggregator

use std::path::PathBuf;

use memory_block::chain::MemoryChainingRule;
use snafu::ensure;

use super::{
    InvalidPartitionCountSnafu, InvalidSpillDirectorySnafu, InvalidSpillingSizesSnafu, Result,
};

/// Configuration of the [`PartitionedAggregator`](super::PartitionedAggregator)
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Number of partitions, must be a power of two
    pub partition_count: usize,
    /// Size of the buffer of each spill file writer, in bytes
    pub spilling_buffer_size: usize,
    /// Number of pairs persisted by a single spill chunk
    pub spilling_chunk_size: usize,
    /// Directory the spill files are created in. It must exist, be a directory and be
    /// writable when spilling is enabled
    pub spill_directory: PathBuf,
    /// Spill the partitions to disk when the memory is exhausted. Otherwise, running
    /// out of memory is fatal
    pub spill_to_disk: bool,
    /// Byte order of the numbers in the key blocks and value blocks
    pub use_big_endian: bool,
    /// Pools the blocks are acquired from
    pub memory_chaining_rule: MemoryChainingRule,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            partition_count: 16,
            spilling_buffer_size: 64 * 1024,
            spilling_chunk_size: 4096,
            spill_directory: std::env::temp_dir(),
            spill_to_disk: true,
            use_big_endian: false,
            memory_chaining_rule: MemoryChainingRule::default(),
        }
    }
}

impl AggregatorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.partition_count.is_power_of_two(),
            InvalidPartitionCountSnafu {
                partition_count: self.partition_count
            }
        );

        if !self.spill_to_disk {
            return Ok(());
        }

        ensure!(
            self.spilling_buffer_size > 0 && self.spilling_chunk_size > 0,
            InvalidSpillingSizesSnafu {
                buffer_size: self.spilling_buffer_size,
                chunk_size: self.spilling_chunk_size,
            }
        );

        let metadata = std::fs::metadata(&self.spill_directory).ok();
        let Some(metadata) = metadata else {
            return InvalidSpillDirectorySnafu {
                path: &self.spill_directory,
                reason: "it does not exist",
            }
            .fail();
        };
        ensure!(
            metadata.is_dir(),
            InvalidSpillDirectorySnafu {
                path: &self.spill_directory,
                reason: "it is not a directory",
            }
        );
        // Permission bits ignore the owner of the directory, so create a file instead
        ensure!(
            tempfile::tempfile_in(&self.spill_directory).is_ok(),
            InvalidSpillDirectorySnafu {
                path: &self.spill_directory,
                reason: "it is not writable",
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregatorError;

    #[test]
    fn test_validate() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = AggregatorConfig {
            spill_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.validate().unwrap();

        let err = AggregatorConfig {
            partition_count: 6,
            ..config.clone()
        }
        .validate()
        .unwrap_err();
        let expect = expect_test::expect!["Partition count `6` is not a power of two"];
        expect.assert_eq(&err.to_string());

        let err = AggregatorConfig {
            spill_directory: dir.path().join("missing"),
            ..config.clone()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(
            err,
            AggregatorError::InvalidSpillDirectory {
                reason: "it does not exist",
                ..
            }
        ));

        let file = dir.path().join("file");
        std::fs::write(&file, b"spill").unwrap();
        let err = AggregatorConfig {
            spill_directory: file,
            ..config.clone()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(
            err,
            AggregatorError::InvalidSpillDirectory {
                reason: "it is not a directory",
                ..
            }
        ));

        let err = AggregatorConfig {
            spilling_chunk_size: 0,
            ..config.clone()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, AggregatorError::InvalidSpillingSizes { .. }));

        // procfs rejects new files whatever the permission bits say
        #[cfg(target_os = "linux")]
        {
            if std::path::Path::new("/proc").is_dir() {
                let err = AggregatorConfig {
                    spill_directory: PathBuf::from("/proc"),
                    ..config.clone()
                }
                .validate()
                .unwrap_err();
                assert!(matches!(
                    err,
                    AggregatorError::InvalidSpillDirectory {
                        reason: "it is not writable",
                        ..
                    }
                ));
            }
        }
        // Validation leaves nothing behind in the spill directory
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        // Directory is not checked if spilling is disabled
        AggregatorConfig {
            spill_directory: dir.path().join("missing"),
            spill_to_disk: false,
            ..config
        }
        .validate()
        .unwrap();
    }
}
