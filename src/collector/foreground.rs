//! Foreground application lookup.
//!
//! The poll sampler queries a [`ForegroundProbe`] on every tick, so
//! application switches are seen even without focus-change callbacks.

use crate::collector::types::AppIdentity;
use std::sync::{Arc, Mutex};

/// Reports the application currently in the foreground.
pub trait ForegroundProbe: Send {
    /// `None` means the lookup failed or nothing is focused.
    fn current(&mut self) -> Option<AppIdentity>;
}

/// Probe whose answer is set by hand. Clones share the same value.
#[derive(Clone, Default)]
pub struct ManualProbe {
    current: Arc<Mutex<Option<AppIdentity>>>,
}

impl ManualProbe {
    pub fn new(initial: Option<AppIdentity>) -> Self {
        Self {
            current: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn set(&self, app: Option<AppIdentity>) {
        let mut guard = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = app;
    }
}

impl ForegroundProbe for ManualProbe {
    fn current(&mut self) -> Option<AppIdentity> {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// The probe for the current platform.
pub fn default_probe() -> Box<dyn ForegroundProbe> {
    #[cfg(target_os = "macos")]
    {
        Box::new(window_list::WindowListProbe::default())
    }
    #[cfg(target_os = "windows")]
    {
        Box::new(foreground_window::ForegroundWindowProbe)
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Box::new(UnsupportedProbe)
    }
}

/// Probe for platforms without a lookup implementation.
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
struct UnsupportedProbe;

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
impl ForegroundProbe for UnsupportedProbe {
    fn current(&mut self) -> Option<AppIdentity> {
        None
    }
}

#[cfg(target_os = "macos")]
mod window_list {
    //! Topmost on-screen window via `CGWindowListCopyWindowInfo`.
    //!
    //! The stable key is the bundle identifier of the owning process, found
    //! from its pid through the enclosing `.app` directory. Processes outside
    //! an app bundle fall back to the owner name.

    use super::ForegroundProbe;
    use crate::collector::types::AppIdentity;
    use core_foundation::base::{CFType, TCFType};
    use core_foundation::bundle::CFBundle;
    use core_foundation::dictionary::{CFDictionary, CFDictionaryRef};
    use core_foundation::number::CFNumber;
    use core_foundation::string::{CFString, CFStringRef};
    use core_foundation::url::CFURL;
    use core_graphics::window::{
        copy_window_info, kCGNullWindowID, kCGWindowLayer, kCGWindowListExcludeDesktopElements,
        kCGWindowListOptionOnScreenOnly, kCGWindowOwnerName, kCGWindowOwnerPID,
    };
    use std::ffi::{c_int, c_void};
    use std::path::{Path, PathBuf};

    const PROC_PIDPATHINFO_MAXSIZE: usize = 4096;

    extern "C" {
        fn proc_pidpath(pid: c_int, buffer: *mut c_void, buffersize: u32) -> c_int;
    }

    /// Remembers the last resolved pid; the foreground app rarely changes
    /// between polls.
    #[derive(Default)]
    pub struct WindowListProbe {
        last: Option<(i64, AppIdentity)>,
    }

    fn lookup(dict: &CFDictionary<CFString, CFType>, key: CFStringRef) -> Option<CFType> {
        let key = unsafe { CFString::wrap_under_get_rule(key) };
        dict.find(&key).map(|value| value.clone())
    }

    fn executable_path(pid: i64) -> Option<PathBuf> {
        let pid = c_int::try_from(pid).ok()?;
        let mut buffer = vec![0u8; PROC_PIDPATHINFO_MAXSIZE];
        let len = unsafe {
            proc_pidpath(
                pid,
                buffer.as_mut_ptr().cast(),
                PROC_PIDPATHINFO_MAXSIZE as u32,
            )
        };
        if len <= 0 {
            return None;
        }
        buffer.truncate(len as usize);
        String::from_utf8(buffer).ok().map(PathBuf::from)
    }

    /// Outermost `.app` directory containing `path`.
    fn app_bundle_dir(path: &Path) -> Option<&Path> {
        path.ancestors()
            .filter(|dir| dir.extension().is_some_and(|ext| ext == "app"))
            .last()
    }

    fn bundle_identifier(pid: i64) -> Option<String> {
        let executable = executable_path(pid)?;
        let url = CFURL::from_path(app_bundle_dir(&executable)?, true)?;
        let info = CFBundle::new(url)?.info_dictionary();
        info.find(&CFString::from_static_string("CFBundleIdentifier"))
            .and_then(|v| v.downcast::<CFString>())
            .map(|s| s.to_string())
            .filter(|id| !id.is_empty())
    }

    impl WindowListProbe {
        fn identify(&mut self, pid: Option<i64>, owner: String) -> AppIdentity {
            let Some(pid) = pid else {
                return AppIdentity::new(owner.clone(), owner);
            };
            if let Some((cached, app)) = &self.last {
                if *cached == pid {
                    return app.clone();
                }
            }
            let key = bundle_identifier(pid).unwrap_or_else(|| owner.clone());
            let app = AppIdentity::new(key, owner);
            self.last = Some((pid, app.clone()));
            app
        }
    }

    impl ForegroundProbe for WindowListProbe {
        fn current(&mut self) -> Option<AppIdentity> {
            let windows = copy_window_info(
                kCGWindowListOptionOnScreenOnly | kCGWindowListExcludeDesktopElements,
                kCGNullWindowID,
            )?;

            for item in windows.iter() {
                let dict: CFDictionary<CFString, CFType> =
                    unsafe { CFDictionary::wrap_under_get_rule(*item as CFDictionaryRef) };

                let layer = lookup(&dict, unsafe { kCGWindowLayer })
                    .and_then(|v| v.downcast::<CFNumber>())
                    .and_then(|n| n.to_i64())
                    .unwrap_or(1);
                if layer != 0 {
                    continue;
                }

                let owner = lookup(&dict, unsafe { kCGWindowOwnerName })
                    .and_then(|v| v.downcast::<CFString>())
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                if owner.is_empty() {
                    continue;
                }
                let pid = lookup(&dict, unsafe { kCGWindowOwnerPID })
                    .and_then(|v| v.downcast::<CFNumber>())
                    .and_then(|n| n.to_i64());
                return Some(self.identify(pid, owner));
            }
            None
        }
    }

}

#[cfg(target_os = "windows")]
mod foreground_window {
    //! `GetForegroundWindow` plus the owning process image path.
    //!
    //! The lower-cased image path is the stable key; the file stem is the
    //! display name.

    use super::ForegroundProbe;
    use crate::collector::types::AppIdentity;
    use std::path::Path;
    use windows::core::PWSTR;
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{
        OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
        PROCESS_QUERY_LIMITED_INFORMATION,
    };
    use windows::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

    pub struct ForegroundWindowProbe;

    impl ForegroundProbe for ForegroundWindowProbe {
        fn current(&mut self) -> Option<AppIdentity> {
            unsafe {
                let hwnd = GetForegroundWindow();
                if hwnd.0.is_null() {
                    return None;
                }

                let mut pid = 0u32;
                GetWindowThreadProcessId(hwnd, Some(&mut pid));
                if pid == 0 {
                    return None;
                }

                let process = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid).ok()?;
                let mut buffer = [0u16; 1024];
                let mut len = buffer.len() as u32;
                let queried = QueryFullProcessImageNameW(
                    process,
                    PROCESS_NAME_WIN32,
                    PWSTR(buffer.as_mut_ptr()),
                    &mut len,
                );
                let _ = CloseHandle(process);
                queried.ok()?;

                let image = String::from_utf16_lossy(&buffer[..len as usize]);
                let display = Path::new(&image)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| image.clone());
                Some(AppIdentity::new(image.to_lowercase(), display))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_probe_shared_between_clones() {
        let probe = ManualProbe::new(None);
        let mut reader = probe.clone();
        assert!(reader.current().is_none());

        probe.set(Some(AppIdentity::new("com.example.editor", "Editor")));
        assert_eq!(reader.current().map(|a| a.key), Some("com.example.editor".to_string()));
    }
}
