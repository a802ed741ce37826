use std::ffi::OsString;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bin_shared::signals::Terminate;
use bin_shared::win32::ERROR_FAILED_SERVICE_CONTROLLER_CONNECT;
use bin_shared::{SERVICE_NAME, known_dirs};
use futures::channel::mpsc;
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
    ServiceType,
};
use windows_service::service_control_handler::{
    self, ServiceControlHandlerResult, ServiceStatusHandle,
};

use super::{ServiceContext, ServiceStart};
use crate::daemon::{self, Dispatcher};
use crate::instance_lock::{InstallationIdentity, InstanceLock};

const SERVICE_TYPE: ServiceType = ServiceType::OWN_PROCESS;

/// `ERROR_SERVICE_ALREADY_RUNNING`, reported when another daemon holds the instance lock.
const ERROR_SERVICE_ALREADY_RUNNING: u32 = 1056;

/// Stop code when logging couldn't be set up.
const ERROR_LOG_SETUP_FAILED: u32 = 1;

/// Handed from [`run`] to the dispatcher thread, which can't take arguments from us.
static CONTEXT: OnceLock<ServiceContext> = OnceLock::new();

/// Cross-platform entry point for the Windows service and systemd
pub fn run(context: ServiceContext) -> Result<ServiceStart> {
    if CONTEXT.set(context).is_err() {
        anyhow::bail!("The service dispatcher can only run once per process");
    }

    match windows_service::service_dispatcher::start(SERVICE_NAME, ffi_service_main) {
        Ok(()) => Ok(ServiceStart::Finished),
        Err(windows_service::Error::Winapi(error))
            if error.raw_os_error()
                == Some(ERROR_FAILED_SERVICE_CONTROLLER_CONNECT as i32) =>
        {
            Ok(ServiceStart::NotUnderServiceManager)
        }
        Err(error) => Err(error).context("windows_service::service_dispatcher failed"),
    }
}

// Generates `ffi_service_main` from `run_service`
windows_service::define_windows_service!(ffi_service_main, run_service);

fn run_service(arguments: Vec<OsString>) {
    let Some(context) = CONTEXT.get().cloned() else {
        return;
    };
    // There is no console under the SCM, so only the log file will see these.
    let _log_handle = match daemon::setup_logging(
        &known_dirs::logs(&context.install_dir),
        &context.settings.log_filter,
        false,
    ) {
        Ok(handle) => handle,
        Err(_) => {
            // Nothing can log the error, only the stop code reaches the SCM.
            if let Ok(status_handle) =
                service_control_handler::register(SERVICE_NAME, |_| ServiceControlHandlerResult::NoError)
            {
                report_stopped(&status_handle, ERROR_LOG_SETUP_FAILED);
            }
            return;
        }
    };

    tracing::info!(?arguments, "run_service");

    if let Err(error) = try_run_service(context) {
        tracing::error!("Service failed: {error:#}");
    }
}

fn try_run_service(context: ServiceContext) -> Result<()> {
    let (mut shutdown_tx, shutdown_rx) = mpsc::channel(1);

    let event_handler = move |control_event| -> ServiceControlHandlerResult {
        tracing::debug!(?control_event);
        match control_event {
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            ServiceControl::Shutdown | ServiceControl::Stop => {
                if shutdown_tx.try_send(()).is_err() {
                    tracing::debug!("Shutdown was already requested");
                }
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::UserEvent(_) => ServiceControlHandlerResult::NoError,
            ServiceControl::Continue
            | ServiceControl::NetBindAdd
            | ServiceControl::NetBindDisable
            | ServiceControl::NetBindEnable
            | ServiceControl::NetBindRemove
            | ServiceControl::ParamChange
            | ServiceControl::Pause
            | ServiceControl::Preshutdown
            | ServiceControl::PowerEvent(_)
            | ServiceControl::HardwareProfileChange(_)
            | ServiceControl::SessionChange(_)
            | ServiceControl::TimeChange
            | ServiceControl::TriggerEvent => {
                tracing::warn!(?control_event, "Unhandled service control event");
                ServiceControlHandlerResult::NotImplemented
            }
            _ => ServiceControlHandlerResult::NotImplemented,
        }
    };

    let status_handle = service_control_handler::register(SERVICE_NAME, event_handler)
        .context("Failed to register Windows service")?;

    let ServiceContext {
        install_dir,
        settings,
    } = context;
    let lock = InstanceLock::acquire(&InstallationIdentity::of(&install_dir));
    let _lock = match lock {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            tracing::warn!("Another daemon of this installation is already running");
            report_stopped(&status_handle, ERROR_SERVICE_ALREADY_RUNNING);
            return Ok(());
        }
        Err(error) => {
            report_stopped(&status_handle, 1);
            return Err(error);
        }
    };

    // Tell Windows that we're running (equivalent to sd_notify in systemd)
    if let Err(error) = status_handle.set_service_status(ServiceStatus {
        service_type: SERVICE_TYPE,
        current_state: ServiceState::Running,
        controls_accepted: ServiceControlAccept::SHUTDOWN | ServiceControlAccept::STOP,
        exit_code: ServiceExitCode::Win32(0),
        checkpoint: 0,
        wait_hint: Duration::default(),
        process_id: None,
    }) {
        tracing::warn!("Couldn't report the Running status: {error}");
    }

    let result = daemon::block_on(Dispatcher::new(settings, install_dir), || {
        Ok(Terminate::from_channel(shutdown_rx))
    });

    // Per Windows docs, this will cause Windows to kill our process eventually.
    report_stopped(&status_handle, if result.is_ok() { 0 } else { 1 });

    result
}

fn report_stopped(status_handle: &ServiceStatusHandle, exit_code: u32) {
    if let Err(error) = status_handle.set_service_status(stopped(exit_code)) {
        tracing::warn!("Couldn't report the Stopped status: {error}");
    }
}

fn stopped(exit_code: u32) -> ServiceStatus {
    ServiceStatus {
        service_type: SERVICE_TYPE,
        current_state: ServiceState::Stopped,
        controls_accepted: ServiceControlAccept::empty(),
        exit_code: ServiceExitCode::Win32(exit_code),
        checkpoint: 0,
        wait_hint: Duration::default(),
        process_id: None,
    }
}
