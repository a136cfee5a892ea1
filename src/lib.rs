// A small stop-and-wait file transfer system over UDP, in the TFTP family
// with two local extensions to the classic wire format:
//
//  - a one-byte compression flag sits between the request opcode and the
//    filename; when set, the payload is gzipped end-to-end before it is
//    chunked into blocks.
//  - text-mode ("netascii") transfers translate the string fields of
//    requests and errors on the wire: \n becomes CR LF and \r becomes
//    CR NUL. DATA payloads are never translated.
//
// The rest follows the classic shape:
//
// Transfer begins with a request to read or write a file. If the server
// grants the request, the file is sent in blocks of 512 bytes, and each data
// packet must be acked before the next one is sent. A data packet shorter
// than 512 bytes ends the transfer.
//
// Transfer identifiers (TIDs) are UDP ports. The requester sends its initial
// request to the well-known port; the server answers from a freshly bound
// port, and both sides pin the peer's address from the first datagram they
// see. Packets from any other address are discarded without touching the
// session, beyond a courtesy "unknown transfer ID" error.
//
// On data loss the sender times out and retransmits its last datagram, up to
// a retry cap. Most errors terminate the session: an error packet is sent as
// a courtesy, never acked and never retransmitted.

pub mod client;
pub mod compress;
pub mod processor;
pub mod server;
pub mod srv_conn;
pub mod tftp;
