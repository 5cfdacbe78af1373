pub mod clock;
pub mod config;
pub mod device;
pub mod monitor;
pub mod payload;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use clock::{Clock, SystemClock};
pub use config::BootConfig;
pub use device::{IdentityReader, Transport, TransportError, UsbSession};
pub use monitor::BootConfirmation;
pub use payload::{BuildError, CombinedImage};
pub use transfer::{TransferError, TransferReport};

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("Failed to prepare PongoOS: {0}")]
    Build(#[from] BuildError),
    #[error("Failed to send PongoOS: {0}")]
    Transfer(#[from] TransferError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOutcome {
    pub transfer: TransferReport,
    /// `None` when confirmation was not requested.
    pub confirmation: Option<BootConfirmation>,
}

/// Opens a device in DFU mode, or one that already runs PongoOS, waiting up to
/// `config.find_timeout` for either to appear.
pub fn open_device(config: &BootConfig) -> Result<UsbSession, TransportError> {
    let mut session = UsbSession::wait_for(
        device::APPLE_VID,
        &[device::DFU_PID, device::PONGO_PID],
        Some(config.find_timeout),
    )?;
    session.set_ready_timeout(config.ready_timeout);
    Ok(session)
}

/// Whether an opened device is past DFU mode and already running PongoOS.
pub fn already_booted(product_id: u16, identity: &str) -> bool {
    product_id == device::PONGO_PID || monitor::is_pongo(identity)
}

/// One-call entry point for library users: builds the combined image from the
/// configured files and boots it on `session`.
///
/// Nothing is sent if the build fails. Callers that want to check the inputs
/// before waiting for a device can use [`payload::build`] and
/// [`send_and_confirm`] instead.
pub fn boot_pongo<S, C>(
    session: &mut S,
    config: &BootConfig,
    clock: &C,
) -> Result<BootOutcome, BootError>
where
    S: Transport + IdentityReader,
    C: Clock,
{
    let image = payload::build(&config.shellcode, &config.image)?;
    send_and_confirm(session, image, config, clock)
}

/// Sends an already built image and, if configured, waits for PongoOS to identify itself.
///
/// A confirmation timeout is reported in the outcome, not as an error.
pub fn send_and_confirm<S, C>(
    session: &mut S,
    image: CombinedImage,
    config: &BootConfig,
    clock: &C,
) -> Result<BootOutcome, BootError>
where
    S: Transport + IdentityReader,
    C: Clock,
{
    tracing::info!(
        "Sending {:#x} byte long PongoOS ({:#x} bytes shellcode, {:#x} bytes compressed)",
        image.len(),
        image.shellcode_len(),
        image.compressed_len()
    );

    let transfer = transfer::send(session, image.as_bytes(), &config.transfer, clock)?;
    drop(image);

    let confirmation = config
        .confirm_boot
        .then(|| monitor::await_boot(session, clock, &config.monitor));

    Ok(BootOutcome {
        transfer,
        confirmation,
    })
}
