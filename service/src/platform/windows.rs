//! Windows service control manager backend.
//!
//! The SCM calls `ServiceMain` and the control handler through plain function
//! pointers, so the current entry point and sink live in process-wide slots
//! that the trampolines read. An own-process service has exactly one of each.

use super::{ControlSink, ServiceControlApi, ServiceEntry, ServiceHandle, ServiceTable};
use crate::error::PlatformError;
use crate::status::StatusBlock;
use std::ffi::c_void;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{GetLastError, ERROR_CALL_NOT_IMPLEMENTED, NO_ERROR};
use windows_sys::Win32::System::Services::{
    RegisterServiceCtrlHandlerExW, SetServiceStatus, StartServiceCtrlDispatcherW, SERVICE_STATUS,
    SERVICE_STATUS_HANDLE, SERVICE_TABLE_ENTRYW,
};

static SERVICE_ENTRY: Mutex<Option<ServiceEntry>> = Mutex::new(None);
static CONTROL_SINK: Mutex<Option<ControlSink>> = Mutex::new(None);

/// [`ServiceControlApi`] backed by advapi32.
#[derive(Debug, Default)]
pub struct WindowsServiceApi;

impl WindowsServiceApi {
    pub fn new() -> Self {
        Self
    }
}

fn last_error() -> PlatformError {
    // SAFETY: GetLastError only reads thread-local state.
    PlatformError::new(unsafe { GetLastError() })
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Read a NUL-terminated UTF-16 string.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated UTF-16 buffer.
unsafe fn from_wide(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}

unsafe extern "system" fn service_main_trampoline(argc: u32, argv: *mut *mut u16) {
    let args = if argv.is_null() {
        Vec::new()
    } else {
        (0..argc as usize)
            .map(|i| from_wide(*argv.add(i)))
            .collect()
    };

    let entry = SERVICE_ENTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match entry {
        Some(entry) => entry(args),
        None => warn!("ServiceMain invoked with no entry point installed"),
    }
}

unsafe extern "system" fn control_trampoline(
    control: u32,
    _event_type: u32,
    _event_data: *mut c_void,
    _context: *mut c_void,
) -> u32 {
    let sink = CONTROL_SINK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match sink {
        Some(sink) if sink(control) => NO_ERROR,
        _ => ERROR_CALL_NOT_IMPLEMENTED,
    }
}

impl ServiceControlApi for WindowsServiceApi {
    fn register_control_handler(
        &self,
        service_name: &str,
        sink: ControlSink,
    ) -> Result<ServiceHandle, PlatformError> {
        *CONTROL_SINK.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);

        let name = to_wide(service_name);
        // SAFETY: `name` is NUL-terminated and outlives the call; the handler is a
        // static function reading CONTROL_SINK.
        let handle: SERVICE_STATUS_HANDLE = unsafe {
            RegisterServiceCtrlHandlerExW(
                name.as_ptr(),
                Some(control_trampoline),
                std::ptr::null(),
            )
        };
        if handle == 0 {
            let err = last_error();
            *CONTROL_SINK.lock().unwrap_or_else(PoisonError::into_inner) = None;
            return Err(err);
        }

        debug!(service = service_name, "Registered control handler");
        Ok(ServiceHandle::from_raw(handle as u64))
    }

    fn set_status(&self, handle: ServiceHandle, status: &StatusBlock) -> Result<(), PlatformError> {
        let field = |index: usize| {
            let start = index * 4;
            u32::from_le_bytes([
                status[start],
                status[start + 1],
                status[start + 2],
                status[start + 3],
            ])
        };
        let record = SERVICE_STATUS {
            dwServiceType: field(0),
            dwCurrentState: field(1),
            dwControlsAccepted: field(2),
            dwWin32ExitCode: field(3),
            dwServiceSpecificExitCode: field(4),
            dwCheckPoint: field(5),
            dwWaitHint: field(6),
        };

        // SAFETY: the handle came from RegisterServiceCtrlHandlerExW and `record`
        // lives for the duration of the call.
        let ok = unsafe { SetServiceStatus(handle.as_raw() as SERVICE_STATUS_HANDLE, &record) };
        if ok == 0 {
            return Err(last_error());
        }
        Ok(())
    }

    fn enter_dispatch_loop(&self, table: &ServiceTable) -> Result<(), PlatformError> {
        *SERVICE_ENTRY.lock().unwrap_or_else(PoisonError::into_inner) = Some(table.entry.clone());

        let mut name = to_wide(&table.service_name);
        let entries = [
            SERVICE_TABLE_ENTRYW {
                lpServiceName: name.as_mut_ptr(),
                lpServiceProc: Some(service_main_trampoline),
            },
            SERVICE_TABLE_ENTRYW {
                lpServiceName: std::ptr::null_mut(),
                lpServiceProc: None,
            },
        ];

        // SAFETY: `entries` and `name` stay on this frame until the dispatcher
        // returns, which only happens after the service has stopped.
        let ok = unsafe { StartServiceCtrlDispatcherW(entries.as_ptr()) };
        let result = if ok == 0 { Err(last_error()) } else { Ok(()) };

        *SERVICE_ENTRY.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *CONTROL_SINK.lock().unwrap_or_else(PoisonError::into_inner) = None;
        result
    }
}
