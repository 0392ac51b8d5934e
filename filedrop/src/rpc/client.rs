//! Webserver-side access to the store process.
//!
//! Calls are serialized: one request is in flight on the RPC socket at any
//! time, so replies never need to be correlated.  Every call runs under a
//! deadline; on expiry the caller gets a timeout fault while the store may
//! finish its work unobserved, its late reply discarded with the channel.

use crate::{
    item::Item,
    net::Fd,
    process,
    rpc::{fdpass::FdChannel, frame, frame::Handler, Fault, Method},
};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::{io, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::unix::pipe,
    sync::Mutex,
    time::timeout,
};

/// Client half of the store RPC.
#[derive(Debug)]
pub struct StoreClient {
    rpc: Mutex<Handler>,
    fds: Mutex<FdChannel>,
    deadline: Duration,
}

impl StoreClient {
    pub fn new(rpc: Handler, fds: FdChannel, deadline: Duration) -> Self {
        Self {
            rpc: Mutex::new(rpc),
            fds: Mutex::new(fds),
            deadline,
        }
    }

    /// Fetch an item's metadata.
    pub async fn get(&self, id: &str) -> Result<Item, Fault> {
        let rpc = self.rpc.lock().await;
        self.call(&rpc, Method::Get, id).await
    }

    /// Open an item's blob; the store answers with a read-only descriptor on
    /// the fd channel.
    pub async fn get_file(&self, id: &str) -> Result<Fd, Fault> {
        let fds = self.fds.lock().await;
        let rpc = self.rpc.lock().await;

        self.call::<str, ()>(&rpc, Method::GetFile, id).await?;

        match timeout(self.deadline, fds.recv()).await {
            Err(_) => Err(Fault::timeout()),
            Ok(Err(err)) => Err(Fault::io(err)),
            Ok(Ok(fd)) => Ok(fd),
        }
    }

    /// Store a new item and its body, returning the assigned id.
    ///
    /// The body crosses into the store through a fresh pipe: its read end is
    /// passed over the fd channel while the bytes are copied into the write
    /// end, concurrently with the actual RPC call.  All three legs must
    /// succeed within the deadline; any failure cancels the rest.
    pub async fn put(&self, item: &Item, body: Bytes) -> Result<String, Fault> {
        let fds = self.fds.lock().await;
        let rpc = self.rpc.lock().await;

        let (pipe_read, pipe_write) = process::pipe().map_err(Fault::io)?;
        let mut writer =
            pipe::Sender::from_owned_fd(pipe_write.into_owned()).map_err(Fault::io)?;

        let copy_body = async move {
            writer.write_all(&body).await?;
            drop(writer);
            Ok::<(), io::Error>(())
        };

        let pass_pipe = async { fds.send(&pipe_read).await };

        let call = async {
            rpc.send(Method::Put.into(), 0, None, item).await?;
            let reply = recv_reply(&rpc, Method::Put).await?;
            reply.decode::<Result<String, Fault>>()
        };

        match timeout(self.deadline, async {
            tokio::try_join!(copy_body, pass_pipe, call)
        })
        .await
        {
            Err(_) => Err(Fault::timeout()),
            Ok(Err(err)) => Err(Fault::io(err)),
            Ok(Ok((_, _, reply))) => reply,
        }
    }

    /// Delete an item; missing ids are not an error.
    pub async fn delete(&self, id: &str) -> Result<(), Fault> {
        let rpc = self.rpc.lock().await;
        self.call(&rpc, Method::Delete, id).await
    }

    async fn call<Req, Rep>(
        &self,
        rpc: &Handler,
        method: Method,
        request: &Req,
    ) -> Result<Rep, Fault>
    where
        Req: Serialize + ?Sized,
        Rep: DeserializeOwned,
    {
        let exchange = async {
            rpc.send(method.into(), 0, None, request).await?;

            let reply = recv_reply(rpc, method).await?;
            reply.decode::<Result<Rep, Fault>>()
        };

        match timeout(self.deadline, exchange).await {
            Err(_) => Err(Fault::timeout()),
            Ok(Err(err)) => Err(Fault::io(err)),
            Ok(Ok(reply)) => reply,
        }
    }
}

/// Wait for the reply matching `method`.
///
/// A reply to an earlier call whose deadline already expired may still be
/// queued on the socket; such late responses are dropped.
async fn recv_reply(rpc: &Handler, method: Method) -> io::Result<frame::Envelope> {
    loop {
        let envelope = match rpc.recv().await? {
            Some(envelope) => envelope,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "store hung up",
                ))
            }
        };

        if envelope.header.is_reply() && envelope.header.method == u32::from(method) {
            return Ok(envelope);
        }

        filedrop_log::debug!(
            "Dropping stale reply";
            "method" => envelope.header.method
        );
    }
}
