

#[cfg(feature = "allow_filesystem")]
mod test_files;
