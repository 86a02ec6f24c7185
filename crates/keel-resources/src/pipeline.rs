//! The two-stage load pipeline run by the worker pools.
//!
//! Stage one (data load) resolves a loader and opens the byte stream. Stage two (content
//! update) turns the stream into a payload, on a content-update worker or on the main
//! thread depending on the type's affinity.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use keel_core::profiling::profile_function;

use crate::error::ResourceError;
use crate::event::ResourceEvent;
use crate::loader::{LoaderOrigin, ResourceStream, ResourceTypeLoader};
use crate::manager::ManagerShared;
use crate::resource::UpdateAffinity;
use crate::slot::{DataLoadStart, ErasedSlot, Transition, UpdateOutcome};
use crate::state::ResourceState;

/// A resource waiting for its loader.
pub(crate) struct DataLoadJob {
    pub slot: Arc<dyn ErasedSlot>,
}

/// A resource waiting for `update_content`.
pub(crate) struct ContentUpdateJob {
    pub slot: Arc<dyn ErasedSlot>,
    pub stream: ResourceStream,
    pub loader: Arc<dyn ResourceTypeLoader>,
    pub origin: LoaderOrigin,
}

/// Run one data-load job.
pub(crate) fn run_data_load(shared: &ManagerShared, job: DataLoadJob) {
    profile_function!();
    let DataLoadJob { slot } = job;
    let header = slot.header();

    let custom_loader = match slot.begin_data_load(shared.is_shutting_down()) {
        DataLoadStart::Proceed { custom_loader } => custom_loader,
        DataLoadStart::Stale(transition) => {
            tracing::debug!(
                "Dropping stale load of {} '{}'",
                header.resource_type,
                header.id
            );
            shared.emit_transition(header, transition);
            shared.finish_flight();
            return;
        }
    };

    let resolved = shared.tables.lock().loaders.resolve(
        header.resource_type,
        &header.id,
        custom_loader.as_ref(),
    );
    tracing::trace!(
        "Opening {} '{}' via {} loader",
        header.resource_type,
        header.id,
        resolved.origin.name()
    );

    let opened = catch_unwind(AssertUnwindSafe(|| {
        resolved.loader.open_data_stream(&header.id)
    }))
    .unwrap_or_else(|_| {
        Err(ResourceError::malformed(
            &header.id,
            "loader panicked while opening the data stream",
        ))
    });

    match opened {
        Ok(stream) => queue_content_update(
            shared,
            ContentUpdateJob {
                slot: Arc::clone(&slot),
                stream,
                loader: resolved.loader,
                origin: resolved.origin,
            },
        ),
        Err(error) => {
            let transition = slot.fail_load();
            report_failure(shared, slot.as_ref(), transition, error);
            shared.finish_flight();
        }
    }
}

/// Route a content update to the queue matching the type's affinity.
pub(crate) fn queue_content_update(shared: &ManagerShared, job: ContentUpdateJob) {
    let key = job.slot.header().id.hash();
    let priority = shared.effective_priority(job.slot.as_ref());
    let queue = match job.slot.affinity() {
        UpdateAffinity::AnyThread => shared.update_queue.as_ref(),
        UpdateAffinity::MainThread => &shared.main_queue,
    };

    match queue.push(key, priority, job) {
        Ok(_) => tracing::trace!("Queued content update (priority {})", priority),
        Err(job) => {
            // Closed by shutdown
            job.loader.close_data_stream(&job.slot.header().id, &job.stream);
            if let Some(transition) = job.slot.cancel_load() {
                shared.emit_transition(job.slot.header(), transition);
            }
            shared.finish_flight();
        }
    }
}

/// Run one content-update job.
pub(crate) fn run_content_update(shared: &ManagerShared, job: ContentUpdateJob) {
    profile_function!();
    let ContentUpdateJob {
        slot,
        stream,
        loader,
        origin,
    } = job;
    let header = slot.header();

    let outcome = slot.update_content(&stream, origin, shared.is_shutting_down());
    loader.close_data_stream(&header.id, &stream);

    match outcome {
        UpdateOutcome::Stale(transition) => {
            tracing::debug!(
                "Dropping stale update of {} '{}'",
                header.resource_type,
                header.id
            );
            shared.emit_transition(header, transition);
        }
        UpdateOutcome::Updated { transition, .. }
            if transition.new == ResourceState::LoadedResourceMissing =>
        {
            let error = ResourceError::malformed(
                &header.id,
                "content update reported the resource as missing",
            );
            report_failure(shared, slot.as_ref(), transition, error);
        }
        UpdateOutcome::Updated {
            transition,
            wants_more,
        } => {
            tracing::debug!(
                "{} '{}' is {} ({} bytes of data, via {})",
                header.resource_type,
                header.id,
                transition.new,
                stream.len(),
                origin.name()
            );
            shared.emit_transition(header, transition);
            if wants_more {
                // Queue the next quality level before this flight ends so the manager
                // never looks idle in between
                shared.request_load(&slot, false);
            }
        }
        UpdateOutcome::Failed { transition, error } => {
            report_failure(shared, slot.as_ref(), transition, error);
        }
    }
    shared.finish_flight();
}

fn report_failure(
    shared: &ManagerShared,
    slot: &dyn ErasedSlot,
    transition: Transition,
    error: ResourceError,
) {
    let header = slot.header();
    tracing::warn!(
        "Failed to load {} '{}': {}",
        header.resource_type,
        header.id,
        error
    );
    shared.emit_transition(header, transition);
    shared.events.broadcast(ResourceEvent::LoadFailed {
        id: header.id.clone(),
        resource_type: header.resource_type,
        kind: error.kind(),
        message: error.to_string(),
    });
}
