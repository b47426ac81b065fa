//! Version check, firmware upgrade and activation, run once at startup.

use std::time::Duration;

use crate::assets::Sound;
use crate::collaborators::Ota;
use crate::error::OtaError;
use crate::orchestrator::strings;
use crate::protocol::DeviceState;

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const MAX_VERSION_RETRIES: u32 = 10;
pub const ACTIVATION_ATTEMPTS: u32 = 10;
const ACTIVATION_PENDING_DELAY: Duration = Duration::from_secs(3);
const ACTIVATION_ERROR_DELAY: Duration = Duration::from_secs(10);
const UPGRADE_NOTICE_DELAY: Duration = Duration::from_secs(3);
const QUIESCE_DELAY: Duration = Duration::from_secs(1);
const WAIT_STEP: Duration = Duration::from_secs(1);

/// What the update flow needs from the running device.
pub trait UpdateHost {
    fn device_state(&self) -> DeviceState;
    fn set_state(&self, state: DeviceState);
    fn set_status(&self, status: &str);
    fn set_chat_message(&self, role: &str, message: &str);
    fn alert(&self, status: &str, message: &str, emotion: &str, sound: Option<Sound>);
    fn play_sound(&self, sound: Sound);
    /// Quiesces audio and recycles the work queue ahead of a firmware transfer.
    fn prepare_for_upgrade(&self);
    fn reboot(&self);
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Version is current and the device is activated.
    Ready,
    /// A firmware transfer ran and the device was told to reboot.
    Rebooting,
    /// Version checks kept failing; continuing with the installed version.
    GaveUp,
}

/// Exponential retry schedule: `initial, 2*initial, 4*initial, ...` for at
/// most `max_attempts - 1` waits.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    delay: Duration,
    attempt: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            delay: initial,
            attempt: 0,
            max_attempts,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Records a failure. `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.delay;
        self.delay = self.delay.saturating_mul(2);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.initial;
    }
}

/// Sleeps in one-second steps; returns early once the device was forced to Idle.
fn wait_unless_idle(host: &dyn UpdateHost, total: Duration) {
    let mut waited = Duration::ZERO;
    while waited < total {
        let step = WAIT_STEP.min(total - waited);
        host.sleep(step);
        waited += step;
        if host.device_state() == DeviceState::Idle {
            break;
        }
    }
}

pub fn check_new_version(ota: &dyn Ota, host: &dyn UpdateHost) -> UpdateOutcome {
    let mut backoff = Backoff::new(INITIAL_RETRY_DELAY, MAX_VERSION_RETRIES);
    loop {
        host.set_state(DeviceState::Activating);
        host.set_status(strings::CHECKING_NEW_VERSION);

        if let Err(err) = ota.check_version() {
            match backoff.next_delay() {
                None => {
                    tracing::error!(attempt = backoff.attempt(), "too many retries, exit version check: {}", err);
                    return UpdateOutcome::GaveUp;
                }
                Some(delay) => {
                    tracing::warn!(
                        attempt = backoff.attempt(),
                        max = MAX_VERSION_RETRIES,
                        "check new version failed, retry in {} seconds: {}",
                        delay.as_secs(),
                        err
                    );
                    wait_unless_idle(host, delay);
                    continue;
                }
            }
        }
        backoff.reset();

        if ota.has_new_version() {
            upgrade(ota, host);
            return UpdateOutcome::Rebooting;
        }

        ota.mark_current_version_valid();
        if !ota.has_activation_code() && !ota.has_activation_challenge() {
            return UpdateOutcome::Ready;
        }

        host.set_status(strings::ACTIVATION);
        if ota.has_activation_code() {
            show_activation_code(ota, host);
        }
        if activate(ota, host) {
            return UpdateOutcome::Ready;
        }
    }
}

fn upgrade(ota: &dyn Ota, host: &dyn UpdateHost) {
    host.alert(strings::OTA_UPGRADE, strings::UPGRADING, "happy", Some(Sound::Upgrade));
    host.sleep(UPGRADE_NOTICE_DELAY);

    host.set_state(DeviceState::Upgrading);
    let message = format!("{}{}", strings::NEW_VERSION, ota.firmware_version());
    host.set_chat_message("system", &message);
    host.prepare_for_upgrade();
    host.sleep(QUIESCE_DELAY);

    let result = ota.start_upgrade(&mut |progress, speed| {
        host.set_chat_message("system", &format!("{}% {}KB/s", progress, speed / 1024));
    });
    match result {
        Ok(()) => tracing::info!("firmware upgrade complete, rebooting"),
        Err(err) => {
            tracing::error!("firmware upgrade failed: {}", err);
            host.set_status(strings::UPGRADE_FAILED);
            host.sleep(UPGRADE_NOTICE_DELAY);
        }
    }
    host.reboot();
}

fn show_activation_code(ota: &dyn Ota, host: &dyn UpdateHost) {
    let message = ota.activation_message();
    let code = ota.activation_code();
    host.alert(strings::ACTIVATION, &message, "happy", Some(Sound::Activation));
    for sound in code.chars().filter_map(Sound::for_digit) {
        host.play_sound(sound);
    }
}

/// Polls the activation endpoint. False when attempts ran out or the device
/// was forced to Idle.
fn activate(ota: &dyn Ota, host: &dyn UpdateHost) -> bool {
    for attempt in 1..=ACTIVATION_ATTEMPTS {
        tracing::info!(attempt, max = ACTIVATION_ATTEMPTS, "activating");
        match ota.activate() {
            Ok(()) => return true,
            Err(OtaError::ActivationTimeout) => host.sleep(ACTIVATION_PENDING_DELAY),
            Err(err) => {
                tracing::warn!("activation failed: {}", err);
                host.sleep(ACTIVATION_ERROR_DELAY);
            }
        }
        if host.device_state() == DeviceState::Idle {
            break;
        }
    }
    false
}
