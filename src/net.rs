// Copyright 2025. The evloop Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Async operations over non-blocking sockets.
//!
//! Every operation suspends on a per-readiness-wait [`Promise`] resolved by
//! the selector callback for the corresponding fd and direction. The runtime
//! does not own the sockets; callers create and close them.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use socket2::{SockAddr, Socket};

use crate::error::{Error, Result};
use crate::event_loop::WeakEventLoop;
use crate::promise::Promise;
use crate::selector::{EventCallback, Interest};

/// Async socket operations bound to one event loop.
///
/// Obtained from [`crate::EventLoop::create_networking`]; one instance is
/// shared for the loop's lifetime. At most one reader and one writer may be
/// waiting on the same fd at a time.
pub struct Networking {
    /// Weak because the loop itself caches this instance.
    event_loop: WeakEventLoop,
    waiters: Rc<RefCell<HashSet<(RawFd, Interest)>>>,
}

// === impl Networking ===

impl Networking {
    pub(crate) fn new(event_loop: WeakEventLoop) -> Self {
        Self {
            event_loop,
            waiters: Rc::new(RefCell::new(HashSet::new())),
        }
    }

    /// Suspends until `sock` signals readability.
    ///
    /// # Errors
    ///
    /// [`Error::SocketMustBeNonBlocking`] for blocking sockets,
    /// [`Error::ConflictingWaiter`] when a reader is already parked on the fd.
    pub async fn wait_readable(&self, sock: &Socket) -> Result<()> {
        ensure_nonblocking(sock)?;
        self.ready(sock.as_raw_fd(), Interest::READABLE).await
    }

    /// Suspends until `sock` signals writability.
    ///
    /// # Errors
    ///
    /// [`Error::SocketMustBeNonBlocking`] for blocking sockets,
    /// [`Error::ConflictingWaiter`] when a writer is already parked on the fd.
    pub async fn wait_writable(&self, sock: &Socket) -> Result<()> {
        ensure_nonblocking(sock)?;
        self.ready(sock.as_raw_fd(), Interest::WRITABLE).await
    }

    /// Initiates a non-blocking connect and suspends until it is decided.
    ///
    /// # Errors
    ///
    /// The `SO_ERROR` reported by the socket when the connect fails, besides
    /// the readiness-wait errors.
    pub async fn connect(&self, sock: &Socket, addr: &SockAddr) -> Result<()> {
        ensure_nonblocking(sock)?;
        match sock.connect(addr) {
            Ok(()) => Ok(()),
            Err(err) if connect_in_progress(&err) => {
                self.wait_writable(sock).await?;
                match sock.take_error()? {
                    Some(err) => Err(err.into()),
                    None => Ok(()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Accepts one connection, suspending until the listener is readable.
    /// The accepted socket is switched to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Readiness-wait errors, or the accept failure itself.
    pub async fn accept(&self, sock: &Socket) -> Result<(Socket, SockAddr)> {
        ensure_nonblocking(sock)?;
        loop {
            self.wait_readable(sock).await?;
            match sock.accept() {
                Ok((conn, addr)) => {
                    conn.set_nonblocking(true)?;
                    return Ok((conn, addr));
                }
                Err(err) if retriable(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Reads up to `amount` bytes, suspending until the socket is readable.
    /// The returned buffer may be shorter; an empty buffer means EOF.
    ///
    /// # Errors
    ///
    /// Readiness-wait errors, or the read failure itself.
    pub async fn read(&self, sock: &Socket, amount: usize) -> Result<Vec<u8>> {
        ensure_nonblocking(sock)?;
        loop {
            self.wait_readable(sock).await?;
            let mut buf = vec![0u8; amount];
            match (&*sock).read(&mut buf) {
                Ok(count) => {
                    buf.truncate(count);
                    return Ok(buf);
                }
                Err(err) if retriable(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Writes all of `data`, re-suspending on partial writes until every
    /// byte is sent.
    ///
    /// # Errors
    ///
    /// Readiness-wait errors, or the write failure itself.
    pub async fn write(&self, sock: &Socket, data: &[u8]) -> Result<()> {
        ensure_nonblocking(sock)?;
        let mut written = 0;
        while written < data.len() {
            self.wait_writable(sock).await?;
            match (&*sock).write(&data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket closed mid-write",
                    )
                    .into());
                }
                Ok(count) => written += count,
                Err(err) if retriable(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// One readiness wait: arm a watch, park on a promise, disarm.
    async fn ready(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let event_loop = self.event_loop.upgrade().ok_or(Error::NoRunningLoop)?;
        if !self.waiters.borrow_mut().insert((fd, interest)) {
            return Err(Error::ConflictingWaiter { fd, interest });
        }

        let promise: Promise<()> = Promise::new(&event_loop);
        let cb: EventCallback = {
            let promise = promise.clone();
            let weak = self.event_loop.clone();
            let waiters = self.waiters.clone();
            Rc::new(move |fired_fd, _| {
                if let Some(event_loop) = weak.upgrade() {
                    let _ = event_loop
                        .with_selector(|s| s.stop_watch(fired_fd, Some(interest), None));
                }
                waiters.borrow_mut().remove(&(fired_fd, interest));
                let _ = promise.set_result(());
            })
        };

        if let Err(err) = event_loop.with_selector(|s| s.add_watch(fd, interest, cb)) {
            self.waiters.borrow_mut().remove(&(fd, interest));
            return Err(err);
        }

        // Cancellation disarms the watch, then the promise transitions.
        {
            let weak = self.event_loop.clone();
            let waiters = self.waiters.clone();
            promise.set_cancel_hook(move |_| {
                if let Some(event_loop) = weak.upgrade() {
                    let _ =
                        event_loop.with_selector(|s| s.stop_watch(fd, Some(interest), None));
                }
                waiters.borrow_mut().remove(&(fd, interest));
                false
            });
        }

        promise.wait().await?;
        Ok(())
    }
}

impl fmt::Debug for Networking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Networking")
            .field("waiters", &self.waiters.borrow().len())
            .finish()
    }
}

fn ensure_nonblocking(sock: &Socket) -> Result<()> {
    if sock.nonblocking()? {
        Ok(())
    } else {
        Err(Error::SocketMustBeNonBlocking)
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
        || err.kind() == io::ErrorKind::WouldBlock
}

fn retriable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::test_util::init_tracing;
    use socket2::{Domain, Type};
    use std::future::Future;
    use std::task::Poll;

    fn nonblocking_pair() -> (Socket, Socket) {
        let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn blocking_sockets_are_rejected() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let networking = event_loop.create_networking();

        let out: Result<Rc<()>> = event_loop.run(async move {
            let (a, _b) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
            match networking.read(&a, 16).await {
                Err(Error::SocketMustBeNonBlocking) => Ok(()),
                other => panic!("expected the non-blocking guard, got {other:?}"),
            }
        });
        out.unwrap();
    }

    #[test]
    fn socketpair_roundtrip() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let networking = event_loop.create_networking();

        let out = event_loop
            .run(async move {
                let (a, b) = nonblocking_pair();
                networking.write(&a, b"over the wire").await?;
                let got = networking.read(&b, 64).await?;
                Ok::<_, Error>(got)
            })
            .unwrap();
        assert_eq!(&**out, b"over the wire");
    }

    #[test]
    fn large_write_is_fully_received() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let networking = event_loop.create_networking();
        let lp = event_loop.clone();

        const TOTAL: usize = 1 << 20;
        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let out = event_loop
            .run(async move {
                let (a, b) = nonblocking_pair();
                let writer = {
                    let networking = lp.create_networking();
                    lp.spawn(async move {
                        networking.write(&a, &payload).await?;
                        Ok(())
                    })
                };

                let mut received = Vec::with_capacity(TOTAL);
                while received.len() < TOTAL {
                    let chunk = networking.read(&b, 64 * 1024).await?;
                    assert!(!chunk.is_empty(), "peer closed early");
                    received.extend_from_slice(&chunk);
                }
                writer.wait().await?;
                Ok::<_, Error>(received)
            })
            .unwrap();
        assert_eq!(*out, expected);
    }

    #[test]
    fn second_reader_on_the_same_fd_conflicts() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let networking = event_loop.create_networking();
        let lp = event_loop.clone();

        let out: Result<Rc<()>> = event_loop.run(async move {
            let (a, _b) = nonblocking_pair();
            let a = Rc::new(a);

            let parked = {
                let networking = lp.create_networking();
                let a = a.clone();
                lp.spawn(async move {
                    // Never becomes readable; parked until cancelled.
                    networking.wait_readable(&a).await
                })
            };
            crate::time::sleep(std::time::Duration::from_millis(5)).await?;

            match networking.wait_readable(&a).await {
                Err(Error::ConflictingWaiter { interest, .. }) => {
                    assert_eq!(interest, Interest::READABLE);
                }
                other => panic!("expected a waiter conflict, got {other:?}"),
            }

            parked.cancel(Some("test over")).unwrap();
            assert!(matches!(parked.wait().await, Err(Error::Cancelled(_))));
            Ok(())
        });
        out.unwrap();
    }

    #[test]
    fn cancelling_a_parked_wait_releases_the_fd() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let networking = event_loop.create_networking();
        let lp = event_loop.clone();

        let out: Result<Rc<()>> = event_loop.run(async move {
            let (a, b) = nonblocking_pair();
            let a = Rc::new(a);

            let parked = {
                let networking = lp.create_networking();
                let a = a.clone();
                lp.spawn(async move { networking.wait_readable(&a).await })
            };
            crate::time::sleep(std::time::Duration::from_millis(5)).await?;
            parked.cancel(None).unwrap();
            assert!(matches!(parked.wait().await, Err(Error::Cancelled(_))));

            // The direction is free again and still functional.
            networking.write(&b, b"ping").await?;
            let got = networking.read(&a, 16).await?;
            assert_eq!(&*got, b"ping");
            Ok(())
        });
        out.unwrap();
    }

    #[test]
    fn readiness_wait_lost_to_a_race_releases_the_fd() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let networking = event_loop.create_networking();
        let lp = event_loop.clone();

        let out: Result<Rc<()>> = event_loop.run(async move {
            let (a, b) = nonblocking_pair();
            let a = Rc::new(a);

            // Race a readiness wait that never fires against a short sleep;
            // the racing task finishes when the sleep wins.
            let racer = {
                let networking = lp.create_networking();
                let a = a.clone();
                lp.spawn(async move {
                    let mut wait = Box::pin({
                        let networking = networking.clone();
                        let a = a.clone();
                        async move { networking.wait_readable(&a).await }
                    });
                    let mut nap =
                        Box::pin(crate::time::sleep(std::time::Duration::from_millis(5)));
                    std::future::poll_fn(|cx| {
                        if let Poll::Ready(out) = wait.as_mut().poll(cx) {
                            return Poll::Ready(out);
                        }
                        nap.as_mut().poll(cx)
                    })
                    .await
                })
            };
            racer.wait().await?;

            // The losing wait was released with the racer: the direction is
            // free again and still functional.
            networking.write(&b, b"ping").await?;
            let got = networking.read(&a, 16).await?;
            assert_eq!(&*got, b"ping");
            Ok(())
        });
        out.unwrap();
    }

    #[test]
    fn tcp_echo_between_two_tasks() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let lp = event_loop.clone();

        let out = event_loop
            .run(async move {
                let listener = Socket::new(Domain::IPV4, Type::STREAM, None)?;
                listener.bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into())?;
                listener.listen(8)?;
                listener.set_nonblocking(true)?;
                let addr = listener.local_addr()?;

                let server = {
                    let networking = lp.create_networking();
                    lp.spawn(async move {
                        let (conn, _peer) = networking.accept(&listener).await?;
                        let request = networking.read(&conn, 64).await?;
                        networking.write(&conn, &request).await?;
                        Ok(())
                    })
                };

                let client = {
                    let networking = lp.create_networking();
                    lp.spawn(async move {
                        let sock = Socket::new(Domain::IPV4, Type::STREAM, None)?;
                        sock.set_nonblocking(true)?;
                        networking.connect(&sock, &addr).await?;
                        networking.write(&sock, b"hello").await?;
                        networking.read(&sock, 64).await
                    })
                };

                server.wait().await?;
                let echoed = client.wait().await?;
                Ok::<_, Error>(echoed)
            })
            .unwrap();
        assert_eq!(&***out, b"hello".as_slice());
    }
}
