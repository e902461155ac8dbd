pub mod packet_io;
pub mod tls;

pub use packet_io::{PacketReader, PacketWriter, MAX_PACKET_SIZE};
pub use tls::{load_certs_pem, parse_endpoint, TlsConfig};
