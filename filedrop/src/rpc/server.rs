//! Store-side dispatch of the RPC channel.

use crate::{
    error::{Error, Result},
    item::Item,
    rpc::{fdpass::FdChannel, frame::Handler, frame::FLAG_REPLY, Fault, Method},
    store::Store,
};
use filedrop_log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::unix::pipe;

/// Serves the store to exactly one RPC peer.
pub struct StoreServer {
    store: Arc<Store>,
    rpc: Handler,
    fds: FdChannel,
}

impl StoreServer {
    pub fn new(store: Arc<Store>, rpc: Handler, fds: FdChannel) -> Self {
        Self { store, rpc, fds }
    }

    /// Answer requests until the peer hangs up.
    ///
    /// Requests are handled one at a time, in arrival order; the peer
    /// serializes its calls anyway.
    pub async fn run(&self) -> Result<()> {
        loop {
            let envelope = match self.rpc.recv().await? {
                Some(envelope) => envelope,
                None => break Ok(()),
            };

            if envelope.header.is_reply() {
                warn!("Ignoring stray reply record"; "method" => envelope.header.method);
                continue;
            }

            let method = Method::try_from(envelope.header.method).map_err(Error::from)?;
            debug!("Handling store request"; "method" => format!("{:?}", method));

            match method {
                Method::Get => {
                    let id: String = envelope.decode()?;
                    let reply = self.store.get(&id).await;
                    self.reply(method, &reply).await?;
                }
                Method::GetFile => {
                    let id: String = envelope.decode()?;
                    match self.store.get_file(&id) {
                        Ok(fd) => {
                            self.reply::<()>(method, &Ok(())).await?;
                            self.fds.send(&fd).await?;
                        }
                        Err(fault) => self.reply::<()>(method, &Err(fault)).await?,
                    }
                }
                Method::Put => {
                    let item: Item = envelope.decode()?;
                    let reply = self.handle_put(item).await;
                    self.reply(method, &reply).await?;
                }
                Method::Delete => {
                    let id: String = envelope.decode()?;
                    let reply = self.store.delete(&id).await;
                    self.reply(method, &reply).await?;
                }
            }
        }
    }

    /// The pipe trick, server side: the body arrives on a pipe whose read
    /// end crosses the descriptor channel right after the request record.
    async fn handle_put(&self, item: Item) -> std::result::Result<String, Fault> {
        let fd = self.fds.recv().await.map_err(Fault::io)?;
        fd.set_nonblocking(true).map_err(Fault::io)?;

        let mut body = pipe::Receiver::from_owned_fd(fd.into_owned()).map_err(Fault::io)?;

        self.store.put(item, &mut body).await
    }

    async fn reply<T: Serialize>(
        &self,
        method: Method,
        reply: &std::result::Result<T, Fault>,
    ) -> Result<()> {
        self.rpc
            .send(method.into(), FLAG_REPLY, None, reply)
            .await
            .map_err(Into::into)
    }
}
