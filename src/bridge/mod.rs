pub mod ipxpkt;
