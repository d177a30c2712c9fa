//! Server network layer: accepts reliable connections, runs one worker per
//! connection and funnels every outgoing message through a single sender task

use crate::session::{Outbound, Session};
use log::{debug, error, info, warn};
use shared::transport::{run_stream_reader, ConnectionEvent, KeepRunning, TcpSender, POLL_INTERVAL};
use shared::{GameConfig, Message, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Messages sent from connection workers to the network sender task
#[derive(Debug)]
pub enum GameMessage {
    Register {
        addr: SocketAddr,
        sender: Arc<TcpSender>,
    },
    SendMessage {
        addr: SocketAddr,
        message: Message,
    },
    Unregister {
        addr: SocketAddr,
    },
}

/// Main server owning the listener and the authoritative session
pub struct Server {
    listener: TcpListener,
    session: Arc<Mutex<Session>>,
    keep_running: KeepRunning,

    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: Option<mpsc::UnboundedReceiver<GameMessage>>,
}

impl Server {
    /// Binds the listener. A `seed` makes werewolf assignment reproducible.
    pub async fn new(addr: &str, config: GameConfig, seed: Option<u64>) -> shared::Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let session = match seed {
            Some(seed) => Session::with_seed(config, seed),
            None => Session::new(config),
        };
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener,
            session: Arc::new(Mutex::new(session)),
            keep_running: KeepRunning::new(),
            game_tx,
            game_rx: Some(game_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Flag that stops the accept loop and every connection worker
    pub fn keep_running(&self) -> KeepRunning {
        self.keep_running.clone()
    }

    pub fn session(&self) -> Arc<Mutex<Session>> {
        Arc::clone(&self.session)
    }

    /// Spawns task that writes queued messages to their connections, in
    /// queue order
    fn spawn_network_sender(&mut self) -> Option<JoinHandle<()>> {
        let mut game_rx = self.game_rx.take()?;

        Some(tokio::spawn(async move {
            let mut connections: HashMap<SocketAddr, Arc<TcpSender>> = HashMap::new();

            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::Register { addr, sender } => {
                        connections.insert(addr, sender);
                    }
                    GameMessage::SendMessage { addr, message } => {
                        let Some(sender) = connections.get(&addr) else {
                            debug!("Dropping message for closed connection {}", addr);
                            continue;
                        };
                        if let Err(e) = sender.send(&message).await {
                            warn!("Failed to send to {}: {}", addr, e);
                            connections.remove(&addr);
                        }
                    }
                    GameMessage::Unregister { addr } => {
                        if let Some(sender) = connections.remove(&addr) {
                            sender.shutdown().await;
                        }
                    }
                }
            }
        }))
    }

    /// Accept loop. Returns once the keep-running flag is cleared.
    pub async fn run(&mut self) -> shared::Result<()> {
        let sender_handle = self.spawn_network_sender();
        info!("Server started successfully");

        while self.keep_running.is_running() {
            match timeout(POLL_INTERVAL, self.listener.accept()).await {
                Err(_) => continue,
                Ok(Ok((stream, addr))) => self.spawn_connection(stream, addr),
                Ok(Err(e)) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }

        info!("Server shutting down");
        if let Some(handle) = sender_handle {
            handle.abort();
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        info!("Client connected from {}", addr);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", addr, e);
        }

        let session = Arc::clone(&self.session);
        let keep_running = self.keep_running.clone();
        let game_tx = self.game_tx.clone();

        tokio::spawn(async move {
            handle_connection(stream, addr, session, keep_running, game_tx).await;
        });
    }
}

/// Connection worker: decodes requests, applies them to the session and
/// queues the reply followed by whatever the session broadcast
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    session: Arc<Mutex<Session>>,
    keep_running: KeepRunning,
    game_tx: mpsc::UnboundedSender<GameMessage>,
) {
    let (reader, writer) = stream.into_split();
    let sender = Arc::new(TcpSender::new(addr, writer));
    if game_tx.send(GameMessage::Register { addr, sender }).is_err() {
        error!("Network sender is gone, dropping connection {}", addr);
        return;
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_stream_reader(reader, keep_running, event_tx));

    while let Some(event) = event_rx.recv().await {
        match event {
            ConnectionEvent::Message(Message::Method(method)) => {
                debug!("{} -> {}", addr, method.name());
                let mut session = session.lock().await;
                if let Some(reply) = session.handle(addr, method) {
                    queue(&game_tx, addr, reply.into());
                }
                flush_outbox(&game_tx, session.take_outbox());
            }
            ConnectionEvent::Message(Message::Response(response)) => {
                debug!("Ignoring unsolicited reply from {}: {:?}", addr, response.status);
            }
            ConnectionEvent::Malformed(e) => {
                warn!("Malformed frame from {}: {}", addr, e);
                queue(&game_tx, addr, Response::error(e.to_string()).into());
            }
            ConnectionEvent::Closed => break,
        }
    }

    info!("Client {} disconnected", addr);
    {
        let mut session = session.lock().await;
        session.disconnect(addr);
        flush_outbox(&game_tx, session.take_outbox());
    }
    let _ = game_tx.send(GameMessage::Unregister { addr });
}

fn queue(game_tx: &mpsc::UnboundedSender<GameMessage>, addr: SocketAddr, message: Message) {
    if let Err(e) = game_tx.send(GameMessage::SendMessage { addr, message }) {
        error!("Failed to queue message for {}: {}", addr, e);
    }
}

fn flush_outbox(game_tx: &mpsc::UnboundedSender<GameMessage>, outbox: Vec<Outbound>) {
    for Outbound { addr, message } in outbox {
        queue(game_tx, addr, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::framing::FrameDecoder;
    use shared::{Method, Status};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_server() -> (SocketAddr, KeepRunning, Arc<Mutex<Session>>) {
        let mut server = Server::new("127.0.0.1:0", GameConfig::default(), Some(7))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let keep_running = server.keep_running();
        let session = server.session();
        tokio::spawn(async move { server.run().await });
        (addr, keep_running, session)
    }

    async fn next_message(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Message {
        let mut chunk = [0u8; 2048];
        loop {
            if let Some(frame) = decoder.next_frame() {
                return frame.unwrap();
            }
            let len = timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .expect("timed out waiting for the server")
                .unwrap();
            assert!(len > 0, "server closed the connection");
            decoder.push(&chunk[..len]);
        }
    }

    async fn next_response(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Response {
        loop {
            if let Message::Response(response) = next_message(stream, decoder).await {
                return response;
            }
        }
    }

    fn join_bytes(username: &str) -> Vec<u8> {
        Message::from(Method::Join {
            username: Some(username.into()),
            udp_address: Some("127.0.0.1".into()),
            udp_port: Some(4242),
        })
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_join_over_tcp() {
        let (addr, keep_running, _) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = FrameDecoder::new();

        stream.write_all(&join_bytes("alice")).await.unwrap();
        let reply = next_response(&mut stream, &mut decoder).await;
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.player_id, Some(0));

        match next_message(&mut stream, &mut decoder).await {
            Message::Method(Method::Roster { clients }) => {
                assert_eq!(clients.len(), 1);
                assert_eq!(clients[0].username, "alice");
                assert_eq!(clients[0].port, 4242);
            }
            other => panic!("expected roster, got {:?}", other),
        }

        keep_running.stop();
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let (addr, keep_running, _) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = FrameDecoder::new();

        stream.write_all(br#"{"method":"teleport"}"#).await.unwrap();
        let reply = next_response(&mut stream, &mut decoder).await;
        assert_eq!(reply.status, Status::Error);

        // The connection survives the bad frame
        stream.write_all(&join_bytes("bob")).await.unwrap();
        let reply = next_response(&mut stream, &mut decoder).await;
        assert_eq!(reply.status, Status::Ok);

        keep_running.stop();
    }

    #[tokio::test]
    async fn test_disconnect_frees_slot() {
        let (addr, keep_running, session) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = FrameDecoder::new();

        stream.write_all(&join_bytes("carol")).await.unwrap();
        next_response(&mut stream, &mut decoder).await;
        assert_eq!(session.lock().await.player_count(), 1);

        drop(stream);
        for _ in 0..50 {
            if session.lock().await.player_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(session.lock().await.player_count(), 0);

        keep_running.stop();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = GameConfig {
            max_werewolves: 4,
            ..GameConfig::default()
        };
        assert!(Server::new("127.0.0.1:0", config, None).await.is_err());
    }
}
