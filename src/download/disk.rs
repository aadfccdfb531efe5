use parking_lot::Mutex;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Free-space shortfall at a download target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub required: u64,
    pub available: u64,
}

impl std::fmt::Display for Shortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Not enough disk space: {} required, {} available",
            format_bytes(self.required),
            format_bytes(self.available)
        )
    }
}

/// Bytes available to unprivileged users on the filesystem holding `dir`
pub fn available_bytes(dir: &Path) -> io::Result<u64> {
    filesystem_space(dir).map(|(_, available)| available)
}

/// Filesystem id and available bytes for `dir`
#[allow(clippy::useless_conversion)]
fn filesystem_space(dir: &Path) -> io::Result<(u64, u64)> {
    let stats = nix::sys::statvfs::statvfs(dir).map_err(io::Error::from)?;
    let available = u64::from(stats.blocks_available()) * u64::from(stats.fragment_size());
    Ok((u64::from(stats.filesystem_id()), available))
}

/// Space promised to transfers still in flight, per filesystem.
/// Reported free space already excludes what those transfers wrote,
/// so only the remainder of each claim is held back.
#[derive(Debug, Clone, Default)]
pub struct SpaceReservations {
    claims: Arc<Mutex<Vec<Arc<Claim>>>>,
}

#[derive(Debug)]
struct Claim {
    filesystem: u64,
    size: u64,
    written: AtomicU64,
}

impl Claim {
    fn outstanding(&self) -> u64 {
        self.size
            .saturating_sub(self.written.load(Ordering::Relaxed))
    }
}

/// Reserved space for one transfer; released on drop
#[derive(Debug)]
pub struct SpaceClaim {
    reservations: SpaceReservations,
    claim: Arc<Claim>,
}

impl SpaceClaim {
    /// Bytes of the current attempt already on disk
    pub fn record_written(&self, bytes: u64) {
        self.claim.written.store(bytes, Ordering::Relaxed);
    }
}

impl Drop for SpaceClaim {
    fn drop(&mut self) {
        self.reservations
            .claims
            .lock()
            .retain(|c| !Arc::ptr_eq(c, &self.claim));
    }
}

impl SpaceReservations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `needed` bytes in `dir`, keeping `margin` free on top of
    /// every other claim on the same filesystem
    pub fn reserve(
        &self,
        dir: &Path,
        needed: u64,
        margin: u64,
    ) -> io::Result<std::result::Result<SpaceClaim, Shortfall>> {
        let (filesystem, available) = filesystem_space(dir)?;
        Ok(self.reserve_on(filesystem, available, needed, margin))
    }

    fn reserve_on(
        &self,
        filesystem: u64,
        available: u64,
        needed: u64,
        margin: u64,
    ) -> std::result::Result<SpaceClaim, Shortfall> {
        let mut claims = self.claims.lock();
        let pending = claims
            .iter()
            .filter(|c| c.filesystem == filesystem)
            .fold(0_u64, |sum, c| sum.saturating_add(c.outstanding()));
        let required = needed.saturating_add(margin).saturating_add(pending);

        if available < required {
            return Err(Shortfall {
                required,
                available,
            });
        }

        let claim = Arc::new(Claim {
            filesystem,
            size: needed,
            written: AtomicU64::new(0),
        });
        claims.push(Arc::clone(&claim));
        drop(claims);

        Ok(SpaceClaim {
            reservations: self.clone(),
            claim,
        })
    }

    /// Bytes still promised to transfers in flight
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.claims
            .lock()
            .iter()
            .fold(0, |sum, c| sum.saturating_add(c.outstanding()))
    }
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
