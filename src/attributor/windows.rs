use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::ProcessStatus::K32GetModuleBaseNameA;
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_READ,
};

use super::{ExeResolver, ProcessIdentity};

/// Resolves a pid to its image basename via the IP Helper connection table
/// plus `OpenProcess`/`K32GetModuleBaseNameA`. No uid concept on Windows.
pub struct WindowsExeResolver;

impl ExeResolver for WindowsExeResolver {
    fn resolve(&self, pid: u32) -> ProcessIdentity {
        let exe_basename = unsafe { module_basename(pid) };
        match exe_basename {
            Some(name) => ProcessIdentity {
                pid,
                uid: None,
                exe_basename: name,
                exe_path: None,
            },
            None => ProcessIdentity::unknown(pid),
        }
    }
}

unsafe fn module_basename(pid: u32) -> Option<String> {
    let handle: HANDLE =
        OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_VM_READ, false, pid).ok()?;

    let mut buf = [0u8; 260];
    let len = K32GetModuleBaseNameA(handle, None, &mut buf);
    let _ = CloseHandle(handle);

    if len == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&buf[..len as usize]).into_owned())
}
