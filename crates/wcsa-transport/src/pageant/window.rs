//! The hidden Pageant window and its message loop

use std::cell::RefCell;
use std::ffi::c_void;
use std::io;
use std::ptr;
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use windows_sys::Win32::Foundation::{CloseHandle, LocalFree, ERROR_SUCCESS, HANDLE, HWND, LPARAM, LRESULT, WPARAM};
use windows_sys::Win32::Security::Authorization::{GetSecurityInfo, SE_KERNEL_OBJECT};
use windows_sys::Win32::Security::{
    EqualSid, GetTokenInformation, TokenUser, OWNER_SECURITY_INFORMATION, PSID, TOKEN_QUERY,
    TOKEN_USER,
};
use windows_sys::Win32::System::DataExchange::COPYDATASTRUCT;
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::System::Memory::{
    MapViewOfFile, OpenFileMappingA, UnmapViewOfFile, VirtualQuery, FILE_MAP_ALL_ACCESS,
    FILE_MAP_WRITE, MEMORY_BASIC_INFORMATION,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DispatchMessageW, GetMessageW, PostMessageW,
    PostQuitMessage, RegisterClassExW, TranslateMessage, UnregisterClassW, MSG, WM_CLOSE,
    WM_COPYDATA, WM_DESTROY, WNDCLASSEXW,
};

use super::{mapped_len, Dispatcher, COPYDATA_TAG, WINDOW_CLASS};

thread_local! {
    static DISPATCHER: RefCell<Option<Dispatcher>> = const { RefCell::new(None) };
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Window running its message loop on a dedicated thread
pub struct PageantWindow {
    hwnd: HWND,
    thread: JoinHandle<()>,
}

impl PageantWindow {
    pub async fn spawn(dispatcher: Dispatcher) -> io::Result<Self> {
        let (created, result) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name("pageant-window".to_string())
            .spawn(move || message_loop(dispatcher, created))?;

        match result.await {
            Ok(Ok(hwnd)) => Ok(Self { hwnd, thread }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::other("pageant window thread exited")),
        }
    }

    /// Destroy the window and wait for its thread
    pub async fn close(self) {
        unsafe {
            PostMessageW(self.hwnd, WM_CLOSE, 0, 0);
        }
        let thread = self.thread;
        let _ = tokio::task::spawn_blocking(move || thread.join()).await;
    }
}

fn message_loop(dispatcher: Dispatcher, created: oneshot::Sender<io::Result<HWND>>) {
    let class = wide(WINDOW_CLASS);
    unsafe {
        let instance = GetModuleHandleW(ptr::null());
        let wc = WNDCLASSEXW {
            cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
            lpfnWndProc: Some(window_proc),
            hInstance: instance,
            lpszClassName: class.as_ptr(),
            ..std::mem::zeroed()
        };
        if RegisterClassExW(&wc) == 0 {
            let _ = created.send(Err(io::Error::last_os_error()));
            return;
        }

        let hwnd = CreateWindowExW(
            0,
            class.as_ptr(),
            class.as_ptr(),
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            instance,
            ptr::null(),
        );
        if hwnd == 0 {
            let _ = created.send(Err(io::Error::last_os_error()));
            UnregisterClassW(class.as_ptr(), instance);
            return;
        }

        DISPATCHER.with(|slot| *slot.borrow_mut() = Some(dispatcher));
        let _ = created.send(Ok(hwnd));

        let mut msg: MSG = std::mem::zeroed();
        while GetMessageW(&mut msg, 0, 0, 0) > 0 {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }

        DISPATCHER.with(|slot| slot.borrow_mut().take());
        UnregisterClassW(class.as_ptr(), instance);
    }
}

unsafe extern "system" fn window_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    match msg {
        WM_COPYDATA => {
            let copy = &*(lparam as *const COPYDATASTRUCT);
            if copy.dwData != COPYDATA_TAG {
                tracing::debug!(tag = copy.dwData, "Unexpected Pageant copy data tag");
                return 0;
            }
            match answer(copy.lpData as *const u8) {
                Ok(true) => 1,
                Ok(false) => 0,
                Err(e) => {
                    tracing::warn!(error = %e, "Pageant request rejected");
                    0
                }
            }
        }
        WM_DESTROY => {
            PostQuitMessage(0);
            0
        }
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

/// Serve the request in the shared memory section named by `name`
unsafe fn answer(name: *const u8) -> io::Result<bool> {
    let mapping = OpenFileMappingA(FILE_MAP_ALL_ACCESS, 0, name);
    if mapping == 0 {
        return Err(io::Error::last_os_error());
    }
    let result = answer_mapping(mapping);
    CloseHandle(mapping);
    result
}

unsafe fn answer_mapping(mapping: HANDLE) -> io::Result<bool> {
    let owner = OwnerSid::of(mapping)?;
    let user = TokenUserSid::current()?;
    let process = OwnerSid::of(GetCurrentProcess())?;
    if EqualSid(owner.sid, user.sid()) == 0 && EqualSid(owner.sid, process.sid) == 0 {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "file mapping owned by another user",
        ));
    }

    let view = MapViewOfFile(mapping, FILE_MAP_WRITE, 0, 0, 0);
    if view.Value.is_null() {
        return Err(io::Error::last_os_error());
    }
    let mut info: MEMORY_BASIC_INFORMATION = std::mem::zeroed();
    let queried = VirtualQuery(
        view.Value,
        &mut info,
        std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
    );
    if queried == 0 {
        let err = io::Error::last_os_error();
        UnmapViewOfFile(view);
        return Err(err);
    }
    let region = std::slice::from_raw_parts_mut(view.Value as *mut u8, mapped_len(info.RegionSize));
    let answered = DISPATCHER.with(|slot| match slot.borrow().as_ref() {
        Some(dispatcher) => dispatcher.handle(region),
        None => false,
    });
    UnmapViewOfFile(view);
    Ok(answered)
}

/// Owner SID of a kernel object, freed on drop
struct OwnerSid {
    sid: PSID,
    descriptor: *mut c_void,
}

impl OwnerSid {
    unsafe fn of(handle: HANDLE) -> io::Result<Self> {
        let mut sid: PSID = ptr::null_mut();
        let mut descriptor: *mut c_void = ptr::null_mut();
        let status = GetSecurityInfo(
            handle,
            SE_KERNEL_OBJECT,
            OWNER_SECURITY_INFORMATION,
            &mut sid,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            &mut descriptor,
        );
        if status != ERROR_SUCCESS {
            return Err(io::Error::from_raw_os_error(status as i32));
        }
        Ok(Self { sid, descriptor })
    }
}

impl Drop for OwnerSid {
    fn drop(&mut self) {
        unsafe {
            LocalFree(self.descriptor as _);
        }
    }
}

/// User SID from the process token
struct TokenUserSid {
    buffer: Vec<u64>,
}

impl TokenUserSid {
    unsafe fn current() -> io::Result<Self> {
        let mut token: HANDLE = 0;
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut needed = 0u32;
        GetTokenInformation(token, TokenUser, ptr::null_mut(), 0, &mut needed);
        let mut buffer = vec![0u64; (needed as usize).div_ceil(8)];
        let ok = GetTokenInformation(
            token,
            TokenUser,
            buffer.as_mut_ptr() as *mut c_void,
            (buffer.len() * 8) as u32,
            &mut needed,
        );
        let err = io::Error::last_os_error();
        CloseHandle(token);
        if ok == 0 {
            return Err(err);
        }
        Ok(Self { buffer })
    }

    fn sid(&self) -> PSID {
        let user = self.buffer.as_ptr() as *const TOKEN_USER;
        unsafe { (*user).User.Sid }
    }
}
