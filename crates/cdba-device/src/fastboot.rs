use std::io::{self, Read, Write};

use thiserror::Error;

/// Status responses are a 4-byte word plus at most 60 bytes of argument.
const RESPONSE_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum FastbootError {
    #[error("transport io failed: {0}")]
    Io(#[from] io::Error),
    #[error("device reported failure: {0}")]
    Failed(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("device accepts {got:#x} bytes, image needs {want:#x}")]
    ShortData { want: usize, got: usize },
    #[error("device closed the connection")]
    Closed,
}

enum Response {
    Okay,
    Data(usize),
}

/// Host side of the fastboot text protocol, over any byte transport.
///
/// Covers the surface needed to push a boot image: `download:%08x` answered
/// by `DATA`, the raw payload answered by `OKAY`, plus `boot` and
/// `continue`. `INFO` lines are surfaced through the caller's `on_info`
/// before the final status arrives; `FAIL` is an error.
pub struct Fastboot<T> {
    transport: T,
}

impl<T: Read + Write> Fastboot<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn download(
        &mut self,
        image: &[u8],
        on_info: &mut dyn FnMut(&str),
    ) -> Result<(), FastbootError> {
        let cmd = format!("download:{:08x}", image.len());
        match self.command(cmd.as_bytes(), on_info)? {
            Response::Data(got) if got >= image.len() => {}
            Response::Data(got) => {
                return Err(FastbootError::ShortData { want: image.len(), got });
            }
            Response::Okay => {
                return Err(FastbootError::Malformed("OKAY where DATA was expected".into()));
            }
        }
        self.transport.write_all(image)?;
        match self.wait_status(on_info)? {
            Response::Okay => Ok(()),
            Response::Data(_) => Err(FastbootError::Malformed("DATA after payload".into())),
        }
    }

    pub fn boot(&mut self, on_info: &mut dyn FnMut(&str)) -> Result<(), FastbootError> {
        match self.command(b"boot", on_info)? {
            Response::Okay => Ok(()),
            Response::Data(_) => Err(FastbootError::Malformed("DATA in reply to boot".into())),
        }
    }

    pub fn continue_boot(&mut self, on_info: &mut dyn FnMut(&str)) -> Result<(), FastbootError> {
        match self.command(b"continue", on_info)? {
            Response::Okay => Ok(()),
            Response::Data(_) => Err(FastbootError::Malformed("DATA in reply to continue".into())),
        }
    }

    fn command(
        &mut self,
        cmd: &[u8],
        on_info: &mut dyn FnMut(&str),
    ) -> Result<Response, FastbootError> {
        self.transport.write_all(cmd)?;
        self.wait_status(on_info)
    }

    fn wait_status(&mut self, on_info: &mut dyn FnMut(&str)) -> Result<Response, FastbootError> {
        loop {
            let mut buf = [0; RESPONSE_LEN];
            let n = self.transport.read(&mut buf)?;
            if n == 0 {
                return Err(FastbootError::Closed);
            }
            if n < 4 {
                return Err(FastbootError::Malformed(
                    String::from_utf8_lossy(&buf[..n]).into_owned(),
                ));
            }
            let arg = String::from_utf8_lossy(&buf[4..n]).into_owned();
            match &buf[..4] {
                b"INFO" => on_info(&arg),
                b"OKAY" => return Ok(Response::Okay),
                b"FAIL" => return Err(FastbootError::Failed(arg)),
                b"DATA" => {
                    let size = usize::from_str_radix(arg.trim(), 16)
                        .map_err(|_| FastbootError::Malformed(arg))?;
                    return Ok(Response::Data(size));
                }
                _ => {
                    return Err(FastbootError::Malformed(
                        String::from_utf8_lossy(&buf[..n]).into_owned(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Transport double: each `read` hands out the next scripted response,
    /// each `write` is recorded.
    #[derive(Default)]
    struct Script {
        responses: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Script {
        fn reply(mut self, resp: &str) -> Self {
            self.responses.push_back(resp.as_bytes().to_vec());
            self
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(resp) = self.responses.pop_front() else {
                return Ok(0);
            };
            buf[..resp.len()].copy_from_slice(&resp);
            Ok(resp.len())
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn download_sends_size_then_payload() {
        let script = Script::default().reply("DATA00001388").reply("OKAY");
        let mut fb = Fastboot::new(script);
        let image = vec![0xab; 0x1388];
        fb.download(&image, &mut |_| {}).unwrap();

        let written = &fb.transport.written;
        assert!(written.starts_with(b"download:00001388"));
        assert_eq!(&written[b"download:00001388".len()..], &image[..]);
    }

    #[test]
    fn info_lines_surface_before_final_status() {
        let script = Script::default()
            .reply("DATA00000004")
            .reply("INFOwriting image")
            .reply("INFOdone")
            .reply("OKAY");
        let mut fb = Fastboot::new(script);
        let mut infos = Vec::new();
        fb.download(&[1, 2, 3, 4], &mut |line| infos.push(line.to_owned())).unwrap();
        assert_eq!(infos, vec!["writing image", "done"]);
    }

    #[test]
    fn fail_is_an_error() {
        let script = Script::default().reply("FAILunknown command");
        let mut fb = Fastboot::new(script);
        match fb.boot(&mut |_| {}) {
            Err(FastbootError::Failed(reason)) => assert_eq!(reason, "unknown command"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_data_offer_is_refused() {
        let script = Script::default().reply("DATA00000002");
        let mut fb = Fastboot::new(script);
        match fb.download(&[0; 16], &mut |_| {}) {
            Err(FastbootError::ShortData { want: 16, got: 2 }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn boot_and_continue_expect_okay() {
        let script = Script::default().reply("OKAY");
        Fastboot::new(script).boot(&mut |_| {}).unwrap();

        let script = Script::default().reply("OKAY");
        Fastboot::new(script).continue_boot(&mut |_| {}).unwrap();

        let script = Script::default();
        match Fastboot::new(script).boot(&mut |_| {}) {
            Err(FastbootError::Closed) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
