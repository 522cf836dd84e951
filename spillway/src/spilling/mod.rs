//! Persist the partitions to disk when the memory is exhausted

pub mod default_spiller;
pub mod spill_file;

use std::fmt::Debug;
use std::path::PathBuf;

use snafu::Snafu;

use crate::common::types::PartitionId;
use crate::partition::Partition;

pub use default_spiller::DefaultSpiller;
pub use spill_file::SpillFileCursor;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SpillError {
    #[snafu(display("Failed to create the spill directory `{}`", path.display()))]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to remove the spill directory `{}`", path.display()))]
    RemoveDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write the spill file `{}`", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to read the spill file `{}`", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "Spill file `{}` is truncated: record at offset `{offset}` is incomplete",
        path.display()
    ))]
    Truncated { path: PathBuf, offset: u64 },
    #[snafu(display("Spiller can not `{operation}` without a started spill episode"))]
    NoEpisode { operation: &'static str },
    #[snafu(display("Spill episode is in progress, it should be stopped before starting a new one"))]
    EpisodeInProgress,
}

/// Result type of the spilling
pub type Result<T> = std::result::Result<T, SpillError>;

/// [`Spiller`] persists the resident pairs of the partitions in bounded chunks. An
/// episode is started by [`Self::start`], driven by [`Self::process_next_chunk`] and
/// finalized by [`Self::stop`]. The partitions passed to the methods of an episode
/// must be identical and must not be mutated during the episode
pub trait Spiller: Debug + Send {
    /// Start a spill episode
    fn start(&mut self, partitions: &[Partition]) -> Result<()>;

    /// Persist the next chunk. Returns true if more chunks remain
    fn process_next_chunk(&mut self, partitions: &[Partition]) -> Result<bool>;

    /// Finalize the episode, all of the persisted pairs are readable afterward
    fn stop(&mut self) -> Result<()>;

    /// Release the file handles and remove the spilled data
    fn dispose(&mut self) -> Result<()>;

    /// Number of pairs persisted since the creation of the spiller
    fn spilled_pairs(&self) -> u64;

    /// Open a cursor over the pairs spilled from the partition. Returns `None` if the
    /// partition has never been spilled
    fn open_spill_file_cursor(&self, partition: PartitionId) -> Result<Option<SpillFileCursor>>;
}
