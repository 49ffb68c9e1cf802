use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use rand::{rngs::OsRng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use super::{CipherSpec, Keystream};

/// Ciphertext queued ahead of the inner writer before `poll_write` stops
/// accepting more.
const MAX_PENDING: usize = 16 * 1024;

/// A fresh IV for `spec` from the OS random source.
pub fn random_iv(spec: &CipherSpec) -> Vec<u8> {
    let mut iv = vec![0; spec.iv_size()];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Reads the peer's plaintext IV prefix.
pub async fn read_iv<R>(spec: &CipherSpec, reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut iv = vec![0; spec.iv_size()];
    reader.read_exact(&mut iv).await?;
    Ok(iv)
}

/// Encrypts everything written through it.
///
/// Bytes are encrypted exactly once, as soon as `poll_write` accepts them,
/// and queued until the inner writer takes them. `poll_flush` drains the
/// queue.
pub struct EncryptWriter<W> {
    inner: W,
    keystream: Box<dyn Keystream>,
    pending: Vec<u8>,
    written: usize,
}

impl<W> EncryptWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W, spec: &CipherSpec, key: &[u8], iv: &[u8]) -> crate::Result<Self> {
        Ok(Self {
            inner,
            keystream: spec.encryptor(key, iv)?,
            pending: Vec::new(),
            written: 0,
        })
    }

    /// Picks a random IV and queues it as the plaintext stream prefix, so it
    /// goes out together with the first encrypted bytes.
    pub fn with_random_iv(inner: W, spec: &CipherSpec, key: &[u8]) -> crate::Result<Self> {
        let iv = random_iv(spec);
        let mut writer = Self::new(inner, spec, key, &iv)?;
        writer.pending = iv;
        Ok(writer)
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let unsent = &self.pending[self.written..];
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, unsent))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W> AsyncWrite for EncryptWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pending.len() - this.written >= MAX_PENDING {
            ready!(this.poll_drain(cx))?;
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        this.keystream.apply(&mut this.pending[start..]);

        // The bytes are ours now; whatever the inner writer does not take
        // here goes out on the next write or flush.
        if let Poll::Ready(Err(err)) = this.poll_drain(cx) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Decrypts everything read through it.
pub struct DecryptReader<R> {
    inner: R,
    keystream: Box<dyn Keystream>,
}

impl<R> DecryptReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, spec: &CipherSpec, key: &[u8], iv: &[u8]) -> crate::Result<Self> {
        Ok(Self {
            inner,
            keystream: spec.decryptor(key, iv)?,
        })
    }

    /// Consumes the peer's IV prefix from `inner` and keys the reader with it.
    pub async fn from_stream(mut inner: R, spec: &CipherSpec, key: &[u8]) -> crate::Result<Self> {
        let iv = read_iv(spec, &mut inner).await?;
        Self::new(inner, spec, key, &iv)
    }
}

impl<R> AsyncRead for DecryptReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.keystream.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;
    use crate::cipher::{derive_key, Registry};

    #[tokio::test]
    async fn writer_and_reader_agree_across_small_pipes() {
        let registry = Registry::with_builtin();
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();

        for name in ["aes-256-cfb", "des-cfb", "rc4-md5"] {
            let spec = *registry.lookup(name).unwrap();
            let key = derive_key("pipe", spec.key_size()).unwrap();
            // A tiny pipe forces partial writes and pending ciphertext.
            let (near, far) = duplex(37);

            let expected = payload.clone();
            let writer = tokio::spawn(async move {
                let mut writer = EncryptWriter::with_random_iv(near, &spec, &key).unwrap();
                for chunk in expected.chunks(1000) {
                    writer.write_all(chunk).await.unwrap();
                }
                writer.shutdown().await.unwrap();
            });

            let key = derive_key("pipe", spec.key_size()).unwrap();
            let mut reader = DecryptReader::from_stream(far, &spec, &key).await.unwrap();
            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.unwrap();
            writer.await.unwrap();

            assert_eq!(received, payload, "{name}");
        }
    }

    #[tokio::test]
    async fn iv_is_sent_in_plaintext_first() {
        let spec = *Registry::with_builtin().lookup("aes-128-cfb").unwrap();
        let key = derive_key("iv", 16).unwrap();
        let (near, mut far) = duplex(1024);

        let mut writer = EncryptWriter::new(near, &spec, &key, &[3; 16]).unwrap();
        writer.write_all(b"abc").await.unwrap();
        writer.flush().await.unwrap();
        let mut ciphertext = [0; 3];
        far.read_exact(&mut ciphertext).await.unwrap();
        assert_ne!(&ciphertext, b"abc");

        let (near, mut far) = duplex(1024);
        let mut writer = EncryptWriter::with_random_iv(near, &spec, &key).unwrap();
        writer.write_all(b"abc").await.unwrap();
        writer.flush().await.unwrap();
        let iv = read_iv(&spec, &mut far).await.unwrap();
        let mut reader = DecryptReader::new(far, &spec, &key, &iv).unwrap();
        let mut plaintext = [0; 3];
        reader.read_exact(&mut plaintext).await.unwrap();
        assert_eq!(&plaintext, b"abc");
    }

    #[tokio::test]
    async fn truncated_iv_is_an_error() {
        let spec = *Registry::with_builtin().lookup("aes-128-cfb").unwrap();
        let key = derive_key("iv", 16).unwrap();

        let result = DecryptReader::from_stream(&[1u8, 2, 3][..], &spec, &key).await;
        assert!(result.is_err());
    }

    #[test]
    fn random_ivs_differ() {
        let spec = *Registry::with_builtin().lookup("rc4-md5").unwrap();
        let a = random_iv(&spec);
        let b = random_iv(&spec);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
