use crate::{error::Result, io::progress::ProgressFn};
use reqwest::blocking::Client;
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::Path,
    time::Duration,
};
use tracing::warn;

pub fn http_client() -> Result<Client> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(60 * 60))
        .build()?;
    Ok(client)
}

/// Counts bytes as they pass through and reports them to a [`ProgressFn`].
struct ProgressWriter<'a, W: Write> {
    inner: W,
    label: &'a str,
    done: u64,
    total: u64,
    progress: &'a ProgressFn,
}

impl<W: Write> Write for ProgressWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.done += n as u64;
        (self.progress)(self.label, self.done, self.total);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streams `url` into `dest` through a `.part` sibling that is renamed into
/// place only once the body has been fully written.
pub fn download_with_progress(
    client: &Client,
    url: &str,
    dest: &Path,
    label: &str,
    progress: &ProgressFn,
) -> Result<u64> {
    let tmp = dest.with_extension("part");

    let mut resp = client.get(url).send()?.error_for_status()?;
    let total = resp.content_length().unwrap_or(0);
    progress(label, 0, total);

    let mut writer = ProgressWriter {
        inner: BufWriter::new(File::create(&tmp)?),
        label,
        done: 0,
        total,
        progress,
    };
    let copied = io::copy(&mut resp, &mut writer)?;
    writer.flush()?;
    drop(writer);

    if total > 0 && copied != total {
        warn!("size mismatch for {url}: expected {total} bytes, got {copied}");
    }

    if dest.exists() {
        fs::remove_file(dest).ok();
    }
    fs::rename(&tmp, dest)?;

    progress(label, copied, total.max(copied));
    Ok(copied)
}
