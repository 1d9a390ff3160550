//! In-process multipart camera server for tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const FRAME_PAYLOAD: &[u8] = b"\xFF\xD8fake-jpeg-payload\xFF\xD9";
const MULTIPART_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Debug, Clone, Copy)]
pub enum MockBehavior {
    /// Sends `count` boundary-delimited parts, one per `interval`, then
    /// closes (`hold == false`) or keeps the socket open.
    Frames {
        count: usize,
        interval: Duration,
        hold: bool,
        content_type: &'static str,
    },
    /// Answers every request with the given status and an empty body.
    Status(u16),
    /// Reads the request and never answers.
    Silent,
}

impl MockBehavior {
    pub fn frames(count: usize, interval: Duration) -> Self {
        MockBehavior::Frames {
            count,
            interval,
            hold: false,
            content_type: MULTIPART_TYPE,
        }
    }

    pub fn endless(interval: Duration) -> Self {
        MockBehavior::Frames {
            count: usize::MAX,
            interval,
            hold: true,
            content_type: MULTIPART_TYPE,
        }
    }

    /// Same parts as `frames`, under a different response content type.
    pub fn frames_as(count: usize, interval: Duration, content_type: &'static str) -> Self {
        MockBehavior::Frames {
            count,
            interval,
            hold: false,
            content_type,
        }
    }
}

pub struct MockStreamServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl MockStreamServer {
    pub async fn spawn(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let heads = requests.clone();

        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(serve(socket, behavior, heads.clone()));
            }
        });

        Self {
            addr,
            accepted,
            requests,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/stream", self.addr)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Raw request heads received so far, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockStreamServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut socket: TcpStream, behavior: MockBehavior, requests: Arc<Mutex<Vec<String>>>) {
    let Some(head) = read_request_head(&mut socket).await else {
        return;
    };
    requests.lock().unwrap().push(head);

    match behavior {
        MockBehavior::Status(code) => {
            let response = format!(
                "HTTP/1.1 {} Mock\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                code
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
        MockBehavior::Frames {
            count,
            interval,
            hold,
            content_type,
        } => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
                content_type
            );
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for _ in 0..count {
                let mut part = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
                part.extend_from_slice(FRAME_PAYLOAD);
                part.extend_from_slice(b"\r\n");
                if socket.write_all(&part).await.is_err() {
                    return;
                }
                sleep(interval).await;
            }
            if hold {
                sleep(Duration::from_secs(3600)).await;
            }
        }
        MockBehavior::Silent => {
            sleep(Duration::from_secs(3600)).await;
        }
    }
    let _ = socket.shutdown().await;
}

async fn read_request_head(socket: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}
