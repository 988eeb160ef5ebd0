//! TCP connector for device-side agents listed in the configuration.

use super::{Connection, Connector};
use crate::config::DaemonConfig;
use devscope_shared::protocol::messages::ChannelKind;
use devscope_shared::protocol::wire::{read_packet, write_packet};
use devscope_shared::DeviceId;
use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

pub struct TcpConnector {
    addresses: HashMap<DeviceId, String>,
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
    max_frame_len: usize,
}

impl TcpConnector {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            addresses: config
                .devices
                .iter()
                .map(|d| (d.id, d.address.clone()))
                .collect(),
            connect_timeout: config.transport.connect_timeout(),
            io_timeout: config.transport.io_timeout(),
            max_frame_len: config.transport.max_frame_len,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, device: DeviceId, kind: ChannelKind) -> io::Result<Box<dyn Connection>> {
        let address = self.addresses.get(&device).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address configured for device {}", device),
            )
        })?;

        let mut last_err = None;
        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    // Data streams may stay silent for the whole run.
                    if kind == ChannelKind::Control {
                        stream.set_read_timeout(self.io_timeout)?;
                        stream.set_write_timeout(self.io_timeout)?;
                    }
                    debug!(device, %addr, channel = %kind, "Connected");
                    return TcpConnection::new(stream, self.max_frame_len)
                        .map(|c| Box::new(c) as Box<dyn Connection>);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve", address),
            )
        }))
    }
}

pub struct TcpConnection {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    max_frame_len: usize,
}

impl TcpConnection {
    fn new(stream: TcpStream, max_frame_len: usize) -> io::Result<Self> {
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream.try_clone()?),
            stream,
            max_frame_len,
        })
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        write_packet(&mut self.writer, frame)
    }

    fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        read_packet(&mut self.reader, self.max_frame_len)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Connection>> {
        Ok(Box::new(TcpConnection::new(
            self.stream.try_clone()?,
            self.max_frame_len,
        )?))
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceEntry;
    use std::net::TcpListener;

    fn config_for(address: String) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.devices.push(DeviceEntry {
            id: 4,
            address,
            capabilities: Default::default(),
        });
        config
    }

    #[test]
    fn test_unknown_device_is_not_found() {
        let connector = TcpConnector::from_config(&DaemonConfig::default());
        let err = connector.connect(9, ChannelKind::Control).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_packets_cross_a_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let packet = read_packet(&mut stream, 1024).unwrap().unwrap();
            write_packet(&mut stream, &packet).unwrap();
        });

        let connector = TcpConnector::from_config(&config_for(addr.to_string()));
        let mut conn = connector.connect(4, ChannelKind::Control).unwrap();
        conn.send(b"frame").unwrap();
        assert_eq!(conn.recv().unwrap().unwrap(), b"frame");
        server.join().unwrap();
        assert!(conn.recv().unwrap().is_none());
    }

    #[test]
    fn test_shutdown_unblocks_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || listener.accept().unwrap());

        let connector = TcpConnector::from_config(&config_for(addr.to_string()));
        let mut conn = connector.connect(4, ChannelKind::Data).unwrap();
        let _peer = server.join().unwrap();
        let closer = conn.try_clone().unwrap();

        let reader = std::thread::spawn(move || conn.recv());
        std::thread::sleep(Duration::from_millis(20));
        closer.shutdown();
        let result = reader.join().unwrap();
        assert!(matches!(result, Ok(None) | Err(_)));
    }
}
