//! Streaming example.
//!
//! This example demonstrates:
//! - Loading resources from a directory on background workers
//! - Streaming quality levels in one at a time
//! - Serving placeholders and lower quality data while loading
//! - Watching lifecycle events
//! - Reclaiming unused resources

use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use keel_core::profiling::{self, ProfilingBackend};
use keel_resources::prelude::*;
use keel_resources::{LockSource, ResourcePriority};

/// A grayscale image pyramid, coarsest level first.
///
/// File format: one byte with the level count, then per level one byte with its edge
/// length followed by `edge * edge` pixels.
#[derive(Debug, Clone)]
struct Image {
    levels: Vec<Vec<u8>>,
    total_levels: u32,
}

impl Image {
    fn parse(bytes: &[u8]) -> Result<Vec<&[u8]>, String> {
        let (&count, mut rest) = bytes.split_first().ok_or("empty file")?;
        let mut levels = Vec::with_capacity(count as usize);
        for level in 0..count {
            let (&edge, tail) = rest
                .split_first()
                .ok_or_else(|| format!("level {} has no size", level))?;
            let len = edge as usize * edge as usize;
            if tail.len() < len {
                return Err(format!("level {} is truncated", level));
            }
            levels.push(&tail[..len]);
            rest = &tail[len..];
        }
        Ok(levels)
    }

    fn edge(&self) -> usize {
        self.levels.last().map_or(0, |level| level.len().isqrt())
    }
}

impl Loadable for Image {
    type Descriptor = ();

    fn update_content(previous: Option<&Self>, ctx: LoadContext<'_>) -> ResourceResult<Loaded<Self>> {
        let levels = Self::parse(ctx.bytes()).map_err(|e| ctx.malformed(e))?;
        let mut image = previous.cloned().unwrap_or(Image {
            levels: Vec::new(),
            total_levels: levels.len() as u32,
        });
        if let Some(next) = levels.get(image.levels.len()) {
            image.levels.push(next.to_vec());
        }

        let loaded = image.levels.len() as u32;
        let desc = LoadDesc::partial(loaded, image.total_levels - loaded);
        Ok(Loaded::new(image, desc))
    }

    fn unload_data(&mut self, what: Unload) -> LoadDesc {
        match what {
            Unload::AllQualityLevels => self.levels.clear(),
            Unload::OneQualityLevel => {
                self.levels.pop();
            }
        }
        let loaded = self.levels.len() as u32;
        LoadDesc::partial(loaded, self.total_levels - loaded)
    }
}

impl MemoryReportable for Image {
    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::new(0, self.levels.iter().map(|level| level.len() as u64).sum())
    }
}

impl Resource for Image {
    fn type_name() -> &'static str {
        "Image"
    }

    fn placeholder() -> Option<Self> {
        Some(Image {
            levels: vec![vec![0x80]],
            total_levels: 1,
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    keel_core::logging::init();

    // Set KEEL_PUFFIN_HTTP to inspect the frames in puffin_viewer
    let backend = if std::env::var_os("KEEL_PUFFIN_HTTP").is_some() {
        ProfilingBackend::PuffinHttp
    } else {
        ProfilingBackend::InProcess
    };
    profiling::init_profiling(backend);

    let temp_dir = tempfile::tempdir()?;
    create_images(temp_dir.path())?;
    println!("Created images in {}", temp_dir.path().display());

    let config = ResourceManagerConfig::default()
        .with_base_path(temp_dir.path())
        .with_auto_free_unused_timeout(Duration::from_millis(200))
        .with_auto_free_unused_threshold(Duration::from_millis(200));
    let manager = ResourceManager::new(config)?;
    let events = manager.subscribe();

    println!("\n=== Streaming ===\n");

    let sky: Handle<Image> = manager.acquire_handle("sky.img", AcquireMode::Load)?;
    let grass: Handle<Image> = manager.acquire_handle("grass.img", AcquireMode::Load)?;
    let missing: Handle<Image> = manager.acquire_handle("missing.img", AcquireMode::Load)?;

    // The sky fills the screen, so it streams in first and fully
    manager.set_resource_priority(&sky, Some(ResourcePriority::High))?;
    manager.request_quality_level(&sky, 4)?;
    manager.request_quality_level(&grass, 2)?;

    let start = Instant::now();
    for frame in 0.. {
        profiling::new_frame();
        manager.per_frame_update();

        let sky_image = manager.begin_access(&sky, FallbackPolicy::AllowLoadingFallback)?;
        let grass_image = manager.begin_access(&grass, FallbackPolicy::AllowFallback)?;
        println!(
            "frame {:>3}: sky {}x{} ({:?}), grass {}x{} ({:?})",
            frame,
            sky_image.edge(),
            sky_image.edge(),
            sky_image.source(),
            grass_image.edge(),
            grass_image.edge(),
            grass_image.source(),
        );

        let done = sky_image.source() == LockSource::Loaded
            && grass_image.source() == LockSource::Loaded
            && !manager.is_any_loading_in_progress();
        if done || start.elapsed() > Duration::from_secs(5) {
            break;
        }
        std::thread::sleep(Duration::from_millis(16));
    }

    let lock = manager.begin_access(&missing, FallbackPolicy::AllowFallback)?;
    println!("\nmissing.img is served as {:?}", lock.source());
    drop(lock);

    println!("\n=== Events ===\n");
    for event in events.drain() {
        match event {
            ResourceEvent::StateChanged { id, old, new, .. } => println!("{}: {} -> {}", id, old, new),
            ResourceEvent::LoadFailed { id, message, .. } => println!("{}: failed ({})", id, message),
            ResourceEvent::Created { id, .. } => println!("{}: created", id),
            _ => {}
        }
    }

    println!("\n=== Auto-unload ===\n");
    println!("Memory before: {:?}", manager.memory_usage());
    drop(grass);
    drop(missing);
    std::thread::sleep(Duration::from_millis(300));
    profiling::new_frame();
    manager.per_frame_update();
    println!(
        "After sweeping: {} resources, {:?}",
        manager.resource_count(),
        manager.memory_usage()
    );

    drop(sky);
    manager.shutdown();
    println!("\n=== Done ===");
    Ok(())
}

fn create_images(path: &Path) -> std::io::Result<()> {
    for (name, levels) in [("sky.img", 4u8), ("grass.img", 3u8)] {
        let mut file = std::fs::File::create(path.join(name))?;
        file.write_all(&[levels])?;
        for level in 0..levels {
            let edge = 1u8 << level;
            file.write_all(&[edge])?;
            file.write_all(&vec![level * 40; edge as usize * edge as usize])?;
        }
    }
    Ok(())
}
