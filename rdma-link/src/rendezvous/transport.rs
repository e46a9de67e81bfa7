use std::io::{ErrorKind, Read, Write};

use rdma_shim::log;

use super::message::Frame;
use crate::consts::FRAME_SIZE;
use crate::CMError;

/// Moves whole frames; a short read or write never reaches the caller
pub trait FrameTransport {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), CMError>;
    fn recv_frame(&mut self) -> Result<Frame, CMError>;
}

/// A frame transport over any blocking byte stream
pub struct StreamTransport<S> {
    stream: S,
}

impl<S: Read + Write> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn classify(step: &'static str, e: std::io::Error) -> CMError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => CMError::Timeout,
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            CMError::Closed
        }
        _ => CMError::Io(step, e),
    }
}

impl<S: Read + Write> FrameTransport for StreamTransport<S> {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), CMError> {
        let mut sent = 0;
        while sent < frame.len() {
            match self.stream.write(&frame[sent..]) {
                Ok(0) => return Err(CMError::Closed),
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Cannot send data over socket: {}", e);
                    return Err(classify("write", e));
                }
            }
        }
        self.stream.flush().map_err(|e| classify("write", e))
    }

    fn recv_frame(&mut self) -> Result<Frame, CMError> {
        let mut frame = [0u8; FRAME_SIZE];
        let mut got = 0;
        while got < frame.len() {
            match self.stream.read(&mut frame[got..]) {
                Ok(0) => {
                    log::error!("peer closed the stream after {} of {} bytes", got, frame.len());
                    return Err(CMError::Closed);
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Cannot read data over socket: {}", e);
                    return Err(classify("read", e));
                }
            }
        }
        Ok(frame)
    }
}
