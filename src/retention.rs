//! Keep/discard decision for closed segments.
//!
//! The encoder writes into a staging directory. When a segment closes the
//! store either moves the file into the feeder's output directory (kept) or
//! deletes it (discarded). Downstream consumers only ever list the output
//! directory, so they never observe a partial or doomed file.
//!
//! Failures are returned, never swallowed: a failed keep leaves the staging
//! file where it is, and a failed delete is not reported as a discard.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::segment::{FeederId, Segment};

/// Outcome of closing a segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Retention {
    /// Published at this path.
    Kept(PathBuf),
    Discarded,
}

impl Retention {
    pub fn is_kept(&self) -> bool {
        matches!(self, Self::Kept(_))
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Root of published video; files land in `{video_dir}/{feeder_id}/`.
    pub video_dir: PathBuf,
    /// Where the encoder writes segments in progress.
    pub staging_dir: PathBuf,
    /// File extension of encoded segments, without the dot.
    pub extension: String,
}

pub struct SegmentStore {
    feeder: FeederId,
    output_dir: PathBuf,
    staging_dir: PathBuf,
    extension: String,
}

impl SegmentStore {
    /// Create the staging and output directories if needed.
    pub fn open(feeder: FeederId, cfg: StoreConfig) -> Result<Self> {
        let extension = cfg.extension.trim().trim_start_matches('.').to_string();
        if extension.is_empty() || extension.contains(['/', '.']) {
            return Err(anyhow!("invalid segment extension '{}'", cfg.extension));
        }
        let output_dir = cfg.video_dir.join(feeder.as_str());
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("create output dir {}", output_dir.display()))?;
        fs::create_dir_all(&cfg.staging_dir)
            .with_context(|| format!("create staging dir {}", cfg.staging_dir.display()))?;
        if same_dir(&output_dir, &cfg.staging_dir) {
            return Err(anyhow!(
                "staging dir must differ from the output dir {}",
                output_dir.display()
            ));
        }
        Ok(Self {
            feeder,
            output_dir,
            staging_dir: cfg.staging_dir,
            extension,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Allocate a segment that starts at `started_at`. Nothing is created on
    /// disk; the encoder creates the staging file.
    ///
    /// Names have one-second resolution. When the plain name is already used
    /// in staging or output, a sequence number is appended.
    pub fn new_segment(&self, started_at: chrono::DateTime<chrono::Utc>) -> Segment {
        let mut file_name = self.feeder.segment_file_name(started_at, &self.extension);
        let mut seq = 1u32;
        while self.name_taken(&file_name) {
            file_name = self
                .feeder
                .numbered_segment_file_name(started_at, seq, &self.extension);
            seq = seq.saturating_add(1);
        }
        let staging_path = self.staging_dir.join(&file_name);
        Segment::new(staging_path, file_name, started_at)
    }

    fn name_taken(&self, file_name: &str) -> bool {
        self.staging_dir.join(file_name).exists() || self.output_dir.join(file_name).exists()
    }

    /// Apply the retention decision. Must only be called after the encoder
    /// has stopped writing the segment.
    pub fn close(&self, segment: Segment) -> Result<Retention> {
        if segment.has_motion() {
            let dest = self.keep(&segment)?;
            log::info!(
                "segment {} kept ({} frames) -> {}",
                segment.file_name(),
                segment.frames(),
                dest.display()
            );
            Ok(Retention::Kept(dest))
        } else {
            self.discard(&segment)?;
            log::info!(
                "segment {} discarded ({} frames, no motion)",
                segment.file_name(),
                segment.frames()
            );
            Ok(Retention::Discarded)
        }
    }

    /// Delete the segment regardless of its motion flag.
    pub fn discard(&self, segment: &Segment) -> Result<()> {
        match fs::remove_file(segment.staging_path()) {
            Ok(()) => Ok(()),
            // The encoder never produced output; nothing to discard.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    "segment {} has no staging file to discard",
                    segment.file_name()
                );
                Ok(())
            }
            Err(err) => Err(anyhow::Error::new(err).context(format!(
                "discard segment {}",
                segment.staging_path().display()
            ))),
        }
    }

    fn keep(&self, segment: &Segment) -> Result<PathBuf> {
        let src = segment.staging_path();
        let dest = self.output_dir.join(segment.file_name());
        if !src.exists() {
            return Err(anyhow!(
                "segment {} has motion but staging file {} is missing",
                segment.file_name(),
                src.display()
            ));
        }
        if dest.exists() {
            return Err(anyhow!(
                "refusing to overwrite published segment {}",
                dest.display()
            ));
        }
        match fs::rename(src, &dest) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                move_across_devices(src, &dest)?;
            }
            Err(err) => {
                return Err(anyhow::Error::new(err).context(format!(
                    "publish segment {} -> {}",
                    src.display(),
                    dest.display()
                )));
            }
        }
        Ok(dest)
    }

    /// Files left in the staging directory, e.g. by a previous crash.
    pub fn leftovers(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.staging_dir)
            .with_context(|| format!("list staging dir {}", self.staging_dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Copy into a hidden file next to `dest`, sync, rename into place, then drop
/// the source. The rename within the output directory keeps publication atomic.
fn move_across_devices(src: &Path, dest: &Path) -> Result<()> {
    let file_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid destination {}", dest.display()))?;
    let partial = dest.with_file_name(format!(".{}.partial", file_name));
    {
        let mut reader =
            File::open(src).with_context(|| format!("open staged segment {}", src.display()))?;
        let mut writer = File::create(&partial)
            .with_context(|| format!("create {}", partial.display()))?;
        io::copy(&mut reader, &mut writer)
            .with_context(|| format!("copy {} -> {}", src.display(), partial.display()))?;
        writer.sync_all()?;
    }
    if let Err(err) = fs::rename(&partial, dest) {
        let _ = fs::remove_file(&partial);
        return Err(anyhow::Error::new(err).context(format!("publish {}", dest.display())));
    }
    fs::remove_file(src)
        .with_context(|| format!("remove staged segment {} after copy", src.display()))?;
    Ok(())
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::FrameSample;
    use chrono::{TimeZone, Utc};

    fn store(root: &Path) -> Result<SegmentStore> {
        SegmentStore::open(
            FeederId::new("feeder1")?,
            StoreConfig {
                video_dir: root.join("videos"),
                staging_dir: root.join("staging"),
                extension: "h264".to_string(),
            },
        )
    }

    fn staged(store: &SegmentStore, motion: bool) -> Result<Segment> {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 6, 30, 0).unwrap();
        let mut segment = store.new_segment(at);
        fs::write(segment.staging_path(), b"encoded")?;
        segment.record(&FrameSample {
            frame_motion: motion,
            active: false,
            at,
        });
        Ok(segment)
    }

    #[test]
    fn motion_segment_is_published() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store(temp_dir.path())?;
        let segment = staged(&store, true)?;
        let staging = segment.staging_path().to_path_buf();

        let outcome = store.close(segment)?;
        let expected = temp_dir
            .path()
            .join("videos/feeder1/feeder1_2024-05-01-06-30-00.h264");
        assert_eq!(outcome, Retention::Kept(expected.clone()));
        assert!(!staging.exists());
        assert_eq!(fs::read(expected)?, b"encoded");
        Ok(())
    }

    #[test]
    fn quiet_segment_is_deleted() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store(temp_dir.path())?;
        let segment = staged(&store, false)?;
        let staging = segment.staging_path().to_path_buf();

        assert_eq!(store.close(segment)?, Retention::Discarded);
        assert!(!staging.exists());
        assert_eq!(fs::read_dir(store.output_dir())?.count(), 0);
        Ok(())
    }

    #[test]
    fn missing_staging_file_fails_keep_but_not_discard() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store(temp_dir.path())?;
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 6, 30, 0).unwrap();

        let quiet = store.new_segment(at);
        assert_eq!(store.close(quiet)?, Retention::Discarded);

        let mut loud = store.new_segment(at);
        loud.record(&FrameSample {
            frame_motion: true,
            active: true,
            at,
        });
        assert!(store.close(loud).is_err());
        Ok(())
    }

    #[test]
    fn existing_destination_is_not_overwritten() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store(temp_dir.path())?;
        let segment = staged(&store, true)?;
        let dest = store.output_dir().join(segment.file_name());
        fs::write(&dest, b"earlier")?;
        let staging = segment.staging_path().to_path_buf();

        assert!(store.close(segment).is_err());
        assert_eq!(fs::read(&dest)?, b"earlier");
        assert!(staging.exists(), "failed keep must leave the staged file");
        Ok(())
    }

    #[test]
    fn same_second_segments_get_numbered_names() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store(temp_dir.path())?;

        let first = staged(&store, true)?;
        assert_eq!(first.file_name(), "feeder1_2024-05-01-06-30-00.h264");
        store.close(first)?;

        // published name is taken, as is a name still being written
        let second = staged(&store, true)?;
        assert_eq!(second.file_name(), "feeder1_2024-05-01-06-30-00_1.h264");
        let third = staged(&store, true)?;
        assert_eq!(third.file_name(), "feeder1_2024-05-01-06-30-00_2.h264");

        assert!(store.close(second)?.is_kept());
        assert!(store.close(third)?.is_kept());
        assert_eq!(fs::read_dir(store.output_dir())?.count(), 3);
        Ok(())
    }

    #[test]
    fn cross_device_move_copies_syncs_and_removes_source() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let src = temp_dir.path().join("staging-seg.h264");
        let out_dir = temp_dir.path().join("out");
        fs::create_dir_all(&out_dir)?;
        let dest = out_dir.join("feeder1_2024-05-01-06-30-00.h264");
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &payload)?;

        move_across_devices(&src, &dest)?;

        assert_eq!(fs::read(&dest)?, payload);
        assert!(!src.exists());
        let names: Vec<String> = fs::read_dir(&out_dir)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<_>>()?;
        assert_eq!(names, vec!["feeder1_2024-05-01-06-30-00.h264".to_string()]);
        Ok(())
    }

    #[test]
    fn cross_device_move_keeps_source_when_copy_fails() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let src = temp_dir.path().join("staging-seg.h264");
        fs::write(&src, b"encoded")?;
        let dest = temp_dir.path().join("missing-dir/seg.h264");

        assert!(move_across_devices(&src, &dest).is_err());
        assert_eq!(fs::read(&src)?, b"encoded");
        Ok(())
    }

    #[test]
    fn leftovers_lists_staged_files() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = store(temp_dir.path())?;
        assert!(store.leftovers()?.is_empty());
        let segment = staged(&store, false)?;
        assert_eq!(store.leftovers()?, vec![segment.staging_path().to_path_buf()]);
        Ok(())
    }

    #[test]
    fn rejects_bad_extension() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let result = SegmentStore::open(
            FeederId::new("feeder1")?,
            StoreConfig {
                video_dir: temp_dir.path().join("videos"),
                staging_dir: temp_dir.path().join("staging"),
                extension: "tar.gz".to_string(),
            },
        );
        assert!(result.is_err());
        Ok(())
    }
}
