//! Positional block reads and writes.

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    use fault_injection::maybe;

    pub fn read_exact_at(
        file: &File,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.read_exact_at(buf, offset))
    }

    pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
        maybe!(file.write_all_at(buf, offset))
    }
}

// Without pread/pwrite the shared cursor is moved. Every handle is
// used from one thread of control, so nobody observes the cursor
// between the seek and the transfer.
#[cfg(not(unix))]
mod imp {
    use std::fs::File;
    use std::io::{self, Read, Seek, SeekFrom, Write};

    use fault_injection::fallible;

    pub fn read_exact_at(
        file: &File,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<()> {
        let mut file = file;
        fallible!(file.seek(SeekFrom::Start(offset)));
        fallible!(file.read_exact(buf));
        Ok(())
    }

    pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut file = file;
        fallible!(file.seek(SeekFrom::Start(offset)));
        fallible!(file.write_all(buf));
        Ok(())
    }
}

pub(crate) use imp::{read_exact_at, write_all_at};
