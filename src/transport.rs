//! Transport seam between the connection manager and the wire.
//!
//! Dialing either dialect yields a split pair: a [`PacketSink`] the
//! writer task owns and a [`PacketSource`] the read loop owns. Both
//! halves present the same contract regardless of dialect, so the
//! connection manager never sees framing details beyond which dialect it
//! dialed.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::codec::{encode_text, BinaryCodec, TextDecoder, TxFrame};
use crate::constants::WEBSOCKET_HELLO;
use crate::error::Result;
use crate::packet::Packet;

/// Read half of a dialed connection.
#[async_trait]
pub trait PacketSource: Send {
    /// Next decoded packet; `Ok(None)` when the peer closed cleanly.
    async fn next_packet(&mut self) -> Result<Option<Packet>>;
}

/// Write half of a dialed connection.
#[async_trait]
pub trait PacketSink: Send {
    async fn send(&mut self, frame: TxFrame) -> Result<()>;
}

/// A dialed connection, split for independent reading and writing.
pub type TransportPair = (Box<dyn PacketSink>, Box<dyn PacketSource>);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial the binary dialect over plain TCP.
pub async fn connect_binary(addr: &str) -> Result<TransportPair> {
    debug!(addr, "dialing binary chat server");
    let stream = TcpStream::connect(addr).await?;
    let (sink, source) = Framed::new(stream, BinaryCodec).split();
    Ok((Box::new(BinarySink(sink)), Box::new(BinarySource(source))))
}

/// Dial the text dialect over a WebSocket and send the opening greeting.
pub async fn connect_websocket(url: &str) -> Result<TransportPair> {
    debug!(url, "dialing websocket chat server");
    let (ws, _response) = connect_async(url).await?;
    let (mut sink, source) = ws.split();
    sink.send(Message::Text(WEBSOCKET_HELLO.into())).await?;
    Ok((
        Box::new(WsSink(sink)),
        Box::new(WsSource { inner: source, decoder: TextDecoder::new() }),
    ))
}

struct BinarySink(SplitSink<Framed<TcpStream, BinaryCodec>, TxFrame>);

#[async_trait]
impl PacketSink for BinarySink {
    async fn send(&mut self, frame: TxFrame) -> Result<()> {
        self.0.send(frame).await
    }
}

struct BinarySource(SplitStream<Framed<TcpStream, BinaryCodec>>);

#[async_trait]
impl PacketSource for BinarySource {
    async fn next_packet(&mut self) -> Result<Option<Packet>> {
        self.0.next().await.transpose()
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl PacketSink for WsSink {
    async fn send(&mut self, frame: TxFrame) -> Result<()> {
        self.0.send(Message::Text(encode_text(&frame).into())).await?;
        Ok(())
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
    decoder: TextDecoder,
}

#[async_trait]
impl PacketSource for WsSource {
    async fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = self.decoder.next_packet()? {
                return Ok(Some(packet));
            }
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => self.decoder.push(&text),
                Some(Ok(Message::Binary(bytes))) => {
                    self.decoder.push(&String::from_utf8_lossy(&bytes));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket closed by server");
                    return Ok(None);
                }
                Some(Ok(other)) => trace!(?other, "ignoring websocket control message"),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }
}
