use bytes::Bytes;

/// Conversion of a native value into one wire argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

macro_rules! int_to_arg {
    ($($ty:ty),*) => {
        $(
            impl ToArg for $ty {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

int_to_arg!(i32, i64, u32, u64, usize);

impl ToArg for f64 {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

/// An ordered, flattened argument list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args(Vec<Bytes>);

impl Args {
    pub fn new() -> Args {
        Args(Vec::new())
    }

    /// Append a single argument.
    #[must_use]
    pub fn add<T: ToArg>(mut self, value: T) -> Args {
        self.0.push(value.to_arg());
        self
    }

    /// Append every item of `values` as its own argument.
    #[must_use]
    pub fn add_flat<I>(mut self, values: I) -> Args
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.0.extend(values.into_iter().map(|v| v.to_arg()));
        self
    }

    pub fn push<T: ToArg>(&mut self, value: T) {
        self.0.push(value.to_arg());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Bytes] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Bytes> {
        self.0.iter()
    }
}

impl From<Vec<Bytes>> for Args {
    fn from(args: Vec<Bytes>) -> Args {
        Args(args)
    }
}

impl IntoIterator for Args {
    type Item = Bytes;
    type IntoIter = std::vec::IntoIter<Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Args {
    type Item = &'a Bytes;
    type IntoIter = std::slice::Iter<'a, Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
