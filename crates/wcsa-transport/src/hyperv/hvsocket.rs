//! `AF_HYPERV` sockets on Windows
//!
//! Winsock exposes Hyper-V sockets as ordinary stream sockets addressed by
//! a VM id and a service id. Accept and connect block, so they run on the
//! blocking pool; connected sockets are then driven by tokio as TCP
//! streams.

use std::io;
use std::mem;
use std::os::windows::io::{FromRawSocket, RawSocket};
use std::ptr;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use uuid::Uuid;
use wcsa_core::VmId;
use windows_sys::core::GUID;
use windows_sys::Win32::Networking::WinSock::{
    accept, bind, closesocket, connect, listen, select, socket, WSAGetLastError, WSAStartup,
    FD_SET, INVALID_SOCKET, SOCKADDR, SOCKET, SOCKET_ERROR, SOCK_STREAM, SOMAXCONN, TIMEVAL,
    WSADATA,
};

use crate::lifecycle::Acceptor;

const AF_HYPERV: i32 = 34;
const HV_PROTOCOL_RAW: i32 = 1;

/// How long one blocking accept waits before reporting a timeout
const ACCEPT_WAIT: Duration = Duration::from_millis(500);

#[repr(C)]
struct SockaddrHv {
    family: u16,
    reserved: u16,
    vm_id: GUID,
    service_id: GUID,
}

impl SockaddrHv {
    fn new(vm: VmId, service: Uuid) -> Self {
        Self {
            family: AF_HYPERV as u16,
            reserved: 0,
            vm_id: GUID::from_u128(vm.as_uuid().as_u128()),
            service_id: GUID::from_u128(service.as_u128()),
        }
    }

    fn as_ptr(&self) -> *const SOCKADDR {
        self as *const Self as *const SOCKADDR
    }

    fn len() -> i32 {
        mem::size_of::<Self>() as i32
    }
}

fn wsa_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

fn startup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        let mut data: WSADATA = mem::zeroed();
        WSAStartup(0x0202, &mut data);
    });
}

/// Owned Hyper-V socket, closed on drop
struct Socket(SOCKET);

impl Socket {
    fn new() -> io::Result<Self> {
        startup();
        let raw = unsafe { socket(AF_HYPERV, SOCK_STREAM, HV_PROTOCOL_RAW) };
        if raw == INVALID_SOCKET {
            return Err(wsa_error());
        }
        Ok(Self(raw))
    }

    fn bind(&self, addr: &SockaddrHv) -> io::Result<()> {
        if unsafe { bind(self.0, addr.as_ptr(), SockaddrHv::len()) } == SOCKET_ERROR {
            return Err(wsa_error());
        }
        if unsafe { listen(self.0, SOMAXCONN as i32) } == SOCKET_ERROR {
            return Err(wsa_error());
        }
        Ok(())
    }

    fn connect(&self, addr: &SockaddrHv) -> io::Result<()> {
        if unsafe { connect(self.0, addr.as_ptr(), SockaddrHv::len()) } == SOCKET_ERROR {
            return Err(wsa_error());
        }
        Ok(())
    }

    /// Accept one connection, or `None` if none arrived within `wait`
    fn accept_within(&self, wait: Duration) -> io::Result<Option<Socket>> {
        let mut readable = FD_SET {
            fd_count: 1,
            fd_array: [0; 64],
        };
        readable.fd_array[0] = self.0;
        let timeout = TIMEVAL {
            tv_sec: wait.as_secs() as i32,
            tv_usec: wait.subsec_micros() as i32,
        };

        let ready = unsafe {
            select(0, &mut readable, ptr::null_mut(), ptr::null_mut(), &timeout)
        };
        match ready {
            SOCKET_ERROR => Err(wsa_error()),
            0 => Ok(None),
            _ => {
                let raw = unsafe { accept(self.0, ptr::null_mut(), ptr::null_mut()) };
                if raw == INVALID_SOCKET {
                    return Err(wsa_error());
                }
                Ok(Some(Socket(raw)))
            }
        }
    }

    fn into_stream(self) -> io::Result<TcpStream> {
        let raw = self.0 as RawSocket;
        mem::forget(self);
        let stream = unsafe { std::net::TcpStream::from_raw_socket(raw) };
        stream.set_nonblocking(true)?;
        TcpStream::from_std(stream)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            closesocket(self.0);
        }
    }
}

/// Listening Hyper-V socket for one VM, or every VM with the wildcard id
pub struct HvListener {
    socket: Arc<Socket>,
    pending: Option<JoinHandle<io::Result<Option<Socket>>>>,
}

impl HvListener {
    pub fn bind(vm: VmId, service: Uuid) -> io::Result<Self> {
        let socket = Socket::new()?;
        socket.bind(&SockaddrHv::new(vm, service))?;
        Ok(Self {
            socket: Arc::new(socket),
            pending: None,
        })
    }

    /// Close the socket once any in-flight accept has returned
    pub async fn close(mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.await;
        }
    }
}

#[async_trait]
impl Acceptor for HvListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
        let socket = self.socket.clone();
        let pending = self
            .pending
            .get_or_insert_with(|| tokio::task::spawn_blocking(move || socket.accept_within(ACCEPT_WAIT)));
        let result = pending.await;
        self.pending = None;

        match result.map_err(io::Error::other)?? {
            Some(conn) => Ok((conn.into_stream()?, "hyperv".to_string())),
            None => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }
}

/// Connect to `service` on the partition `vm`
pub async fn dial(vm: VmId, service: Uuid) -> io::Result<TcpStream> {
    let socket = tokio::task::spawn_blocking(move || {
        let socket = Socket::new()?;
        socket.connect(&SockaddrHv::new(vm, service))?;
        Ok::<_, io::Error>(socket)
    })
    .await
    .map_err(io::Error::other)??;
    socket.into_stream()
}
