use std::time::Duration;

use crate::{
    clock::Clock,
    device::{
        APPLE_VID, DFU_CLRSTATUS, DFU_DNLOAD, DFU_REQUEST_TYPE, PONGO_PID, Transport,
        TransportError,
    },
};

/// Largest payload the device accepts in a single DFU download request.
pub const CHUNK_SIZE: usize = 0x800;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOptions {
    /// Attempts per chunk before giving up. `None` retries forever.
    pub chunk_retry_limit: Option<u32>,
    pub show_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferReport {
    pub bytes_sent: usize,
    /// Download requests issued, retries included.
    pub download_requests: usize,
    pub retries: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Device disappeared whilst sending chunk at offset {offset:#x}: {source}")]
    DeviceGone { offset: usize, source: rusb::Error },
    #[error("Device rejected chunk at offset {offset:#x} {attempts} times")]
    RetriesExhausted { offset: usize, attempts: u32 },
    #[error("Failed to reopen device after handoff: {0}")]
    Reopen(TransportError),
    #[error("Device never became ready after handoff: {0}")]
    NotReady(TransportError),
}

fn progress_bar(len: usize) -> indicatif::ProgressBar {
    let pb = indicatif::ProgressBar::new(len as u64);
    let style = indicatif::ProgressStyle::with_template(
        "[{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})",
    )
    .map(|style| {
        style
            .with_key(
                "eta",
                |state: &indicatif::ProgressState, w: &mut dyn std::fmt::Write| {
                    write!(w, "{:.1}s", state.eta().as_secs_f64()).unwrap();
                },
            )
            .progress_chars("#>-")
    })
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Sends one chunk until the device acknowledges all of it.
fn send_chunk<T: Transport, C: Clock>(
    session: &mut T,
    clock: &C,
    chunk: &[u8],
    offset: usize,
    options: &TransferOptions,
    report: &mut TransferReport,
) -> Result<(), TransferError> {
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        report.download_requests += 1;

        match session.write_control(DFU_REQUEST_TYPE, DFU_DNLOAD, 0, 0, chunk) {
            Ok(amount) if amount == chunk.len() => return Ok(()),
            Ok(amount) => {
                tracing::debug!(
                    "Device only accepted {amount} out of {} bytes, retrying at offset {offset:#x}",
                    chunk.len()
                );
            }
            Err(rusb::Error::NoDevice) => {
                return Err(TransferError::DeviceGone {
                    offset,
                    source: rusb::Error::NoDevice,
                });
            }
            Err(why) => {
                tracing::debug!("Transfer failed ({why}), retrying at offset {offset:#x}");
            }
        }

        if let Some(limit) = options.chunk_retry_limit {
            if attempts >= limit {
                return Err(TransferError::RetriesExhausted { offset, attempts });
            }
        }

        report.retries += 1;
        clock.sleep(RETRY_BACKOFF);
    }
}

/// Streams `image` to a device in DFU mode, then hands the session over to the
/// identity the device takes once it starts executing the image.
pub fn send<T: Transport, C: Clock>(
    session: &mut T,
    image: &[u8],
    options: &TransferOptions,
    clock: &C,
) -> Result<TransferReport, TransferError> {
    tracing::debug!("Sending PongoOS of size {:#x}", image.len());

    let pb = options.show_progress.then(|| progress_bar(image.len()));
    let mut report = TransferReport::default();

    while report.bytes_sent < image.len() {
        let offset = report.bytes_sent;
        let chunk = &image[offset..(offset + CHUNK_SIZE).min(image.len())];

        send_chunk(session, clock, chunk, offset, options, &mut report)?;
        report.bytes_sent += chunk.len();

        if let Some(pb) = pb.as_ref() {
            pb.set_position(report.bytes_sent as u64);
        }
    }

    if let Some(pb) = pb.as_ref() {
        pb.finish_and_clear();
    }

    tracing::debug!(
        "Sent {:#x} bytes in {} requests ({} retries)",
        report.bytes_sent,
        report.download_requests,
        report.retries
    );

    // The device may already be jumping into the image, so neither of these has to succeed.
    if let Err(why) = session.write_control(DFU_REQUEST_TYPE, DFU_CLRSTATUS, 0, 0, &[]) {
        tracing::debug!("Clear status request failed: {why}");
    }
    if let Err(why) = session.reset() {
        tracing::debug!("{why}");
    }
    session.close();

    session
        .reopen(APPLE_VID, PONGO_PID)
        .map_err(TransferError::Reopen)?;

    tracing::info!("Waiting for PongoOS to boot");
    session.wait_ready().map_err(TransferError::NotReady)?;

    Ok(report)
}
