// Console TCP Server
//
// Accepts console connections and serves each session on a blocking worker
// thread, with one pooled view per authenticated session.

use anyhow::Result;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::{execute, Reply};
use crate::fsal::{PooledView, User, ViewFactory};

/// Console server handing out views from a shared factory
pub struct ConsoleServer {
    addr: String,
    factory: Arc<ViewFactory>,
    users: Arc<[User]>,
}

impl ConsoleServer {
    pub fn new(addr: String, factory: Arc<ViewFactory>, users: Vec<User>) -> Self {
        Self {
            addr,
            factory,
            users: users.into(),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Console server listening on {}", self.addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            info!("New connection from {}", peer_addr);

            // Sessions use blocking I/O against the view
            let stream = match socket.into_std().and_then(|s| s.set_nonblocking(false).map(|_| s)) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to prepare connection from {}: {}", peer_addr, e);
                    continue;
                }
            };

            let factory = self.factory.clone();
            let users = self.users.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = handle_connection(stream, &factory, &users) {
                    error!("Connection error from {}: {}", peer_addr, e);
                }
                debug!("Session with {} finished", peer_addr);
            });
        }
    }
}

fn handle_connection(stream: TcpStream, factory: &ViewFactory, users: &[User]) -> Result<()> {
    let reader = BufReader::new(stream.try_clone()?);
    serve_session(reader, &stream, factory, users)
}

/// Serve one console session until `quit` or end of input
///
/// The session's view, if one was created, goes back to the factory however
/// the session ends.
pub fn serve_session<R: BufRead, W: Write>(
    mut reader: R,
    mut writer: W,
    factory: &ViewFactory,
    users: &[User],
) -> Result<()> {
    let mut view = None;
    let result = session_loop(&mut reader, &mut writer, factory, users, &mut view);
    if let Some(view) = view.take() {
        factory.save_view(view);
    }
    result
}

fn session_loop<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    factory: &ViewFactory,
    users: &[User],
    view: &mut Option<PooledView>,
) -> Result<()> {
    writeln!(writer, "ready")?;
    writer.flush()?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            debug!("Connection closed by peer");
            return Ok(());
        }

        let reply = match view.as_mut() {
            Some(active) => execute(&mut **active, &line),
            None => login(&line, factory, users, view),
        };

        writeln!(writer, "{}", reply)?;
        writer.flush()?;
        if reply == Reply::Bye {
            return Ok(());
        }
    }
}

/// Handle a line before the session is authenticated
fn login(line: &str, factory: &ViewFactory, users: &[User], view: &mut Option<PooledView>) -> Reply {
    let line = line.trim();
    if line.eq_ignore_ascii_case("quit") {
        return Reply::Bye;
    }
    let Some(name) = line.strip_prefix("user ").map(str::trim) else {
        return Reply::Err("login first".to_string());
    };
    let Some(user) = users.iter().find(|user| user.name == name) else {
        warn!("Unknown user {:?}", name);
        return Reply::Err(format!("unknown user {}", name));
    };

    match factory.create_view(user) {
        Ok(created) => {
            info!("User {} logged in ({} store)", user.name, created.kind());
            let home = created.working_path().to_string();
            *view = Some(created);
            Reply::Ok(format!("welcome {}, home {}", user.name, home))
        }
        Err(e) => {
            warn!("Failed to create view for {}: {}", user.name, e);
            Reply::Err(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsal::{DocumentTreeStore, MemoryDocumentProvider, StoreKind};
    use std::io::Cursor;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    fn tree_factory() -> (ViewFactory, Arc<MemoryDocumentProvider>) {
        let provider = Arc::new(MemoryDocumentProvider::new("primary:"));
        provider.mkdirs("home/alice").expect("Failed to seed");
        let store = Arc::new(DocumentTreeStore::new(provider.clone()));
        (ViewFactory::new(None, Some(store), 4), provider)
    }

    fn users() -> Vec<User> {
        vec![
            User::new("alice", StoreKind::DocumentTree).with_home("/home/alice"),
            User::new("bob", StoreKind::Local),
        ]
    }

    fn run_script(factory: &ViewFactory, script: &str) -> Vec<String> {
        let mut output = Vec::new();
        serve_session(Cursor::new(script.as_bytes()), &mut output, factory, &users())
            .expect("Session failed");
        String::from_utf8(output)
            .expect("Output is UTF-8")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_session_script() {
        let (factory, provider) = tree_factory();
        let lines = run_script(&factory, "pwd\nuser alice\npwd\nput notes.txt hi\nquit\npwd\n");

        assert_eq!(lines[0], "ready");
        assert_eq!(lines[1], "err login first");
        assert_eq!(lines[2], "ok welcome alice, home /home/alice");
        assert_eq!(lines[3], "ok /home/alice");
        assert_eq!(lines[4], "ok 2 bytes");
        assert_eq!(lines[5], "bye");
        assert_eq!(lines.len(), 6, "Nothing is served after quit");

        assert!(provider.lookup("home/alice/notes.txt").is_some());
        assert_eq!(factory.pooled_views(StoreKind::DocumentTree), 1);
    }

    #[test]
    fn test_view_saved_on_eof() {
        let (factory, _provider) = tree_factory();
        run_script(&factory, "user alice\ncd /\n");
        assert_eq!(factory.pooled_views(StoreKind::DocumentTree), 1);
    }

    #[test]
    fn test_login_failures() {
        let (factory, _provider) = tree_factory();
        let lines = run_script(&factory, "user mallory\nuser bob\nquit\n");
        assert_eq!(lines[1], "err unknown user mallory");
        assert!(lines[2].starts_with("err Backend not configured"), "{}", lines[2]);
        assert_eq!(lines[3], "bye");
        assert_eq!(factory.pooled_views(StoreKind::DocumentTree), 0);
    }

    #[tokio::test]
    async fn test_tcp_session() {
        let (factory, _provider) = tree_factory();
        let server = Arc::new(ConsoleServer::new("127.0.0.1:0".to_string(), Arc::new(factory), users()));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let accept = server.clone();
        tokio::spawn(async move {
            let _ = accept.serve(listener).await;
        });

        let stream = tokio::net::TcpStream::connect(addr).await.expect("Failed to connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = tokio::io::BufReader::new(read_half).lines();

        assert_eq!(lines.next_line().await.expect("read").as_deref(), Some("ready"));
        write_half.write_all(b"user alice\npwd\nquit\n").await.expect("write");
        assert!(lines.next_line().await.expect("read").unwrap_or_default().starts_with("ok welcome"));
        assert_eq!(lines.next_line().await.expect("read").as_deref(), Some("ok /home/alice"));
        assert_eq!(lines.next_line().await.expect("read").as_deref(), Some("bye"));
    }
}
