use quick_error::quick_error;

use crate::machine::{MachineId, RequestId};
use crate::protocol::messages::ExecResult;

quick_error! {
    #[derive(Debug)]
    pub enum CbdError {
        IoError(err: std::io::Error) {
            from()
            display("IO error: {}", err)
            source(err)
        }
        SerializationError(err: rmp_serde::encode::Error) {
            from()
            display("serialization error: {}", err)
            source(err)
        }
        MalformedFrame(err: rmp_serde::decode::Error) {
            from()
            display("malformed frame: {}", err)
            source(err)
        }
        SysError(err: nix::Error) {
            from()
            display("system error: {}", err)
            source(err)
        }
        Timeout {
            display("operation timed out")
        }
        ConnectionClosed {
            display("connection closed")
        }
        UnknownTag(tag: u8) {
            display("unknown message tag: {}", tag)
        }
        UnexpectedMessage(expected: &'static str, found: &'static str) {
            display("expected message {}, got {}", expected, found)
        }
        InvalidPacket(reason: &'static str) {
            display("invalid discovery packet: {}", reason)
        }
        NoSourceAddresses {
            display("no source addresses given")
        }
        NoReachableWorker {
            display("no available and reachable worker")
        }
        WorkerNotFound(id: MachineId) {
            display("could not find worker: {}", id)
        }
        RequestNotFound(guid: RequestId) {
            display("could not find request with id: {}", guid)
        }
        CacheMiss {
            display("data not in cache")
        }
        CompilerFailed(result: ExecResult) {
            display("compiler exited with status {}", result.ret)
        }
        GenericError(message: String) {
            display("error: {}", message)
        }
    }
}
