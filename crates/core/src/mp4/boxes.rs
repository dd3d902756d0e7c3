/// Four-character box type.
pub type FourCc = [u8; 4];

/// Size of a compact box header: 32-bit size + four-character type.
pub const BOX_HEADER_LEN: usize = 8;

/// An ISO BMFF box: raw payload bytes followed by child boxes.
///
/// Boxes are assembled with a consuming builder and serialized bottom-up, so
/// every size field is computed from the bytes actually written:
///
/// ```
/// use streamcore::mp4::Mp4Box;
///
/// let mfhd = Mp4Box::full(b"mfhd", 0, 0).u32(7);
/// let moof = Mp4Box::new(b"moof").child(mfhd);
/// let bytes = moof.to_bytes();
/// assert_eq!(bytes.len(), moof.size());
/// assert_eq!(&bytes[0..4], &24u32.to_be_bytes());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Mp4Box {
    kind: FourCc,
    payload: Vec<u8>,
    children: Vec<Mp4Box>,
}

impl Mp4Box {
    pub fn new(kind: &FourCc) -> Self {
        Self {
            kind: *kind,
            payload: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A "full box": payload starts with a version byte and 24-bit flags.
    pub fn full(kind: &FourCc, version: u8, flags: u32) -> Self {
        Self::new(kind).u8(version).bytes(&flags.to_be_bytes()[1..])
    }

    pub fn kind(&self) -> &FourCc {
        &self.kind
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.payload.push(value);
        self
    }

    pub fn u16(self, value: u16) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    pub fn i16(self, value: i16) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    pub fn u32(self, value: u32) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    pub fn i32(self, value: i32) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    pub fn u64(self, value: u64) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    pub fn zeros(mut self, count: usize) -> Self {
        self.payload.resize(self.payload.len() + count, 0);
        self
    }

    pub fn child(mut self, child: Mp4Box) -> Self {
        self.children.push(child);
        self
    }

    /// Serialized size: header, payload, then every child's size.
    pub fn size(&self) -> usize {
        BOX_HEADER_LEN + self.payload.len() + self.children.iter().map(Mp4Box::size).sum::<usize>()
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.size() as u32).to_be_bytes());
        out.extend_from_slice(&self.kind);
        out.extend_from_slice(&self.payload);
        for child in &self.children {
            child.write_to(out);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        self.write_to(&mut out);
        out
    }
}

/// Split a buffer into its top-level boxes as `(type, body)` pairs.
///
/// Returns `None` unless the declared sizes tile the buffer exactly.
pub fn split_boxes(mut buf: &[u8]) -> Option<Vec<(FourCc, &[u8])>> {
    let mut boxes = Vec::new();
    while !buf.is_empty() {
        let size = u32::from_be_bytes(buf.get(0..4)?.try_into().ok()?) as usize;
        if size < BOX_HEADER_LEN || size > buf.len() {
            return None;
        }
        let kind: FourCc = buf[4..8].try_into().ok()?;
        boxes.push((kind, &buf[BOX_HEADER_LEN..size]));
        buf = &buf[size..];
    }
    Some(boxes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_box_is_header_only() {
        let b = Mp4Box::new(b"free");
        assert_eq!(b.to_bytes(), [0, 0, 0, 8, b'f', b'r', b'e', b'e']);
    }

    #[test]
    fn full_box_writes_version_and_flags() {
        let b = Mp4Box::full(b"tfhd", 1, 0x020008);
        assert_eq!(&b.to_bytes()[8..], &[1, 0x02, 0x00, 0x08]);
    }

    #[test]
    fn nested_sizes_are_exact() {
        let inner = Mp4Box::new(b"bbbb").zeros(5);
        let outer = Mp4Box::new(b"aaaa")
            .u16(1)
            .child(inner.clone())
            .child(inner);
        let bytes = outer.to_bytes();
        assert_eq!(bytes.len(), 8 + 2 + 2 * 13);
        assert_eq!(u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize, bytes.len());

        let top = split_boxes(&bytes).unwrap();
        assert_eq!(top.len(), 1);
        let children = split_boxes(&top[0].1[2..]).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|(kind, body)| kind == b"bbbb" && body.len() == 5));
    }

    #[test]
    fn split_rejects_bad_sizes() {
        assert!(split_boxes(&[0, 0, 0, 4, b'a', b'b', b'c', b'd']).is_none());
        assert!(split_boxes(&[0, 0, 0, 9, b'a', b'b', b'c', b'd']).is_none());
        assert!(split_boxes(&[0, 0]).is_none());
        assert_eq!(split_boxes(&[]).unwrap().len(), 0);
    }
}
