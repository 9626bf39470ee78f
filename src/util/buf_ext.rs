use anyhow::{anyhow, bail};


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}


/// Fallible readers for parsing untrusted datagrams. All multi-byte numbers are in network byte
///  order.
pub trait BufExt: bytes::Buf {
    get_try_impl!(get_u8_checked, u8, get_u8);
    get_try_impl!(get_u16_checked, u16, get_u16);

    /// Reads an ASCII string terminated by a single null byte, consuming the terminator. Fails
    ///  if there is no terminator in the remaining buffer.
    fn try_get_cstring(&mut self) -> anyhow::Result<String> {
        let mut raw = Vec::new();
        loop {
            if !self.has_remaining() {
                bail!("string is not null terminated");
            }
            match self.get_u8() {
                0 => break,
                b if b.is_ascii() => raw.push(b),
                b => bail!("non-ASCII byte 0x{:02x} in string", b),
            }
        }
        Ok(String::from_utf8(raw)?)
    }
}

pub trait BufMutExt: bytes::BufMut {
    /// writes the string's bytes followed by a single null terminator
    fn put_cstring(&mut self, s: &str) {
        self.put_slice(s.as_bytes());
        self.put_u8(0);
    }
}


impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}
