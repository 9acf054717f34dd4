//! Discovery windows Xshell scans for
//!
//! Xshell enumerates windows of class `NSSSH:AGENTWND`, reads the cookie
//! from the title and the TCP port from the window's user data. The
//! `_SINGLE_INSTANCE::XAGENT` window marks Xagent as already running.

#[cfg(not(windows))]
use std::io;

pub const AGENT_WINDOW_CLASS: &str = "NSSSH:AGENTWND";
pub const SINGLE_INSTANCE_TITLE: &str = "_SINGLE_INSTANCE::XAGENT";

#[cfg(windows)]
pub use imp::Beacon;

/// Nothing to advertise outside Windows
#[cfg(not(windows))]
pub struct Beacon;

#[cfg(not(windows))]
impl Beacon {
    pub fn spawn(_cookie: &str, _port: u16) -> io::Result<Self> {
        Ok(Beacon)
    }

    pub async fn close(self) {}
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::ptr;
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    use windows_sys::Win32::Foundation::HWND;
    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows_sys::Win32::System::Threading::GetCurrentThreadId;
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
        PostThreadMessageW, RegisterClassExW, SetWindowLongPtrW, TranslateMessage,
        UnregisterClassW, GWLP_USERDATA, MSG, WM_QUIT, WNDCLASSEXW,
    };

    use super::{AGENT_WINDOW_CLASS, SINGLE_INSTANCE_TITLE};

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// The two discovery windows, owned by their own thread
    pub struct Beacon {
        thread_id: u32,
        thread: JoinHandle<()>,
    }

    impl Beacon {
        pub fn spawn(cookie: &str, port: u16) -> io::Result<Self> {
            let cookie = wide(cookie);
            let (created, result) = mpsc::channel();
            let thread = std::thread::Builder::new()
                .name("xshell-beacon".to_string())
                .spawn(move || run(cookie, port, created))?;

            match result.recv() {
                Ok(Ok(thread_id)) => Ok(Self { thread_id, thread }),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::other("xshell beacon thread exited")),
            }
        }

        pub async fn close(self) {
            unsafe {
                PostThreadMessageW(self.thread_id, WM_QUIT, 0, 0);
            }
            let thread = self.thread;
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }

    unsafe fn create(class: &[u16], title: &[u16]) -> io::Result<HWND> {
        let hwnd = CreateWindowExW(
            0,
            class.as_ptr(),
            title.as_ptr(),
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            GetModuleHandleW(ptr::null()),
            ptr::null(),
        );
        if hwnd == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(hwnd)
    }

    fn run(cookie: Vec<u16>, port: u16, created: mpsc::Sender<io::Result<u32>>) {
        let class = wide(AGENT_WINDOW_CLASS);
        let single_class = wide("STATIC");
        let single_title = wide(SINGLE_INSTANCE_TITLE);

        unsafe {
            let instance = GetModuleHandleW(ptr::null());
            let wc = WNDCLASSEXW {
                cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
                lpfnWndProc: Some(DefWindowProcW),
                hInstance: instance,
                lpszClassName: class.as_ptr(),
                ..std::mem::zeroed()
            };
            if RegisterClassExW(&wc) == 0 {
                let _ = created.send(Err(io::Error::last_os_error()));
                return;
            }

            let agent = match create(&class, &cookie) {
                Ok(hwnd) => hwnd,
                Err(e) => {
                    let _ = created.send(Err(e));
                    UnregisterClassW(class.as_ptr(), instance);
                    return;
                }
            };
            let single = match create(&single_class, &single_title) {
                Ok(hwnd) => hwnd,
                Err(e) => {
                    let _ = created.send(Err(e));
                    DestroyWindow(agent);
                    UnregisterClassW(class.as_ptr(), instance);
                    return;
                }
            };
            SetWindowLongPtrW(agent, GWLP_USERDATA, port as isize);
            let _ = created.send(Ok(GetCurrentThreadId()));

            let mut msg: MSG = std::mem::zeroed();
            while GetMessageW(&mut msg, 0, 0, 0) > 0 {
                TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }

            DestroyWindow(single);
            DestroyWindow(agent);
            UnregisterClassW(class.as_ptr(), instance);
        }
    }
}

#[cfg(all(test, not(windows)))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_beacon_is_noop() {
        Beacon::spawn("abcdefg", 1234).unwrap().close().await;
    }
}
