use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use bincode::Options;
use derive_more::From;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{
    model::{EventSender, Message, Transport},
    Addr,
};

fn serialize<M: Serialize>(message: &M) -> crate::Result<Vec<u8>> {
    Ok(bincode::options().serialize(message)?)
}

fn deserialize<M: DeserializeOwned>(buf: &[u8]) -> crate::Result<M> {
    Ok(bincode::options().allow_trailing_bytes().deserialize(buf)?)
}

#[derive(Debug, Clone, From)]
pub struct UdpSocket(Arc<tokio::net::UdpSocket>);

impl UdpSocket {
    pub async fn bind(addr: std::net::SocketAddr) -> crate::Result<Self> {
        Ok(Self(Arc::new(tokio::net::UdpSocket::bind(addr).await?)))
    }

    pub async fn listen_loop<M, E>(&self, event: EventSender<E>) -> crate::Result<()>
    where
        M: DeserializeOwned + Into<E> + Send + 'static,
    {
        let mut buf = vec![0; 65536];
        loop {
            let (len, _remote) = self.0.recv_from(&mut buf).await?;
            event.send(deserialize::<M>(&buf[..len])?)?
        }
    }

    pub fn into_transport<N>(self) -> UdpTransport<N> {
        UdpTransport(self.0, PhantomData)
    }
}

#[derive(Debug)]
pub struct UdpTransport<N>(Arc<tokio::net::UdpSocket>, PhantomData<N>);

impl<N> Clone for UdpTransport<N> {
    fn clone(&self) -> Self {
        Self(self.0.clone(), PhantomData)
    }
}

#[async_trait::async_trait]
impl<M, N> Transport<M> for UdpTransport<N>
where
    M: Into<N> + Send + 'static,
    N: Serialize + Send + Sync + 'static,
{
    fn addr(&self) -> Addr {
        Addr::Socket(self.0.local_addr().expect("retrievable local address"))
    }

    async fn send_to(&self, destination: Addr, message: M) -> crate::Result<()>
    where
        M: Message,
    {
        let Addr::Socket(destination) = destination else {
            crate::bail!("unsupported destination kind {destination:?}")
        };
        let buf = serialize(&message.into())?;
        self.0.send_to(&buf, destination).await?;
        Ok(())
    }
}

/// Loss-free in-memory datagram network keyed by `Addr::Untyped` names.
///
/// Mirrors UDP semantics where it matters for the protocols: datagrams to an
/// endpoint nobody listens on are silently dropped, which is what a crashed
/// or mute replica looks like to the sequencer.
#[derive(Debug, Clone, Default)]
pub struct MemoryNet(Arc<Mutex<HashMap<Addr, tokio::sync::mpsc::UnboundedSender<Vec<u8>>>>>);

impl MemoryNet {
    pub fn bind(&self, addr: impl Into<Addr>) -> MemoryMailbox {
        let addr = addr.into();
        let chan = tokio::sync::mpsc::unbounded_channel();
        self.0
            .lock()
            .expect("memory net lock poisoned")
            .insert(addr, chan.0);
        MemoryMailbox(chan.1)
    }

    pub fn transport<N>(&self, addr: impl Into<Addr>) -> MemoryTransport<N> {
        MemoryTransport(self.clone(), addr.into(), PhantomData)
    }
}

#[derive(Debug, From)]
pub struct MemoryMailbox(tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>);

impl MemoryMailbox {
    pub async fn listen_loop<M, E>(mut self, event: EventSender<E>) -> crate::Result<()>
    where
        M: DeserializeOwned + Into<E> + Send + 'static,
    {
        while let Some(buf) = self.0.recv().await {
            event.send(deserialize::<M>(&buf)?)?
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryTransport<N>(MemoryNet, Addr, PhantomData<N>);

impl<N> Clone for MemoryTransport<N> {
    fn clone(&self) -> Self {
        Self(self.0.clone(), self.1.clone(), PhantomData)
    }
}

#[async_trait::async_trait]
impl<M, N> Transport<M> for MemoryTransport<N>
where
    M: Into<N> + Send + 'static,
    N: Serialize + Send + Sync + 'static,
{
    fn addr(&self) -> Addr {
        self.1.clone()
    }

    async fn send_to(&self, destination: Addr, message: M) -> crate::Result<()>
    where
        M: Message,
    {
        let buf = serialize(&message.into())?;
        let MemoryNet(endpoints) = &self.0;
        let sink = endpoints
            .lock()
            .expect("memory net lock poisoned")
            .get(&destination)
            .cloned();
        match sink {
            Some(sink) => sink.send(buf).unwrap_or_else(|_| {
                debug!("dropping datagram to closed endpoint {destination}")
            }),
            None => debug!("dropping datagram to unbound endpoint {destination}"),
        }
        Ok(())
    }
}
