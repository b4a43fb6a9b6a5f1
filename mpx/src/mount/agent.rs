//! The on-device VFS agent.
//!
//! One code unit, injected once per session, defines a file class and a
//! VFS class that tunnel filesystem calls to the host as length-prefixed
//! frames on stdout and read framed replies from stdin. Keyboard interrupt
//! is masked for the duration of each exchange so a stray `Ctrl-C` cannot
//! tear a frame in half.
//!
//! The agent is deliberately terse: it ships over the wire on every
//! session (and again after every soft reset), so short names are bytes
//! saved.

/// Agent source; `__CHUNK__` is replaced with the negotiated chunk size.
const AGENT_SOURCE: &str = r#"import sys,io,os,micropython
_mx_i=sys.stdin.buffer
_mx_o=sys.stdout.buffer
def _mx_rq(k,m,p):
 micropython.kbd_intr(-1)
 _mx_o.write(b'\x18\xa6')
 _mx_o.write(bytes([k,m]))
 _mx_o.write(len(p).to_bytes(2,'little'))
 if p:_mx_o.write(p)
 while True:
  if _mx_i.read(1)[0]!=0x18:continue
  if _mx_i.read(1)[0]==0xa6:break
 h=_mx_i.read(4)
 n=h[2]|(h[3]<<8)
 r=_mx_i.read(n) if n else b''
 micropython.kbd_intr(3)
 if not r:raise OSError(5)
 if r[0]:raise OSError(r[0])
 return r[1:]
def _mx_u16(b,o):
 return b[o]|(b[o+1]<<8)
def _mx_u32(b,o):
 return b[o]|(b[o+1]<<8)|(b[o+2]<<16)|(b[o+3]<<24)
class _MXFile(io.IOBase):
 def __init__(s,m,h,t):
  s.m=m;s.h=h;s.t=t;s.b=b'';s.o=0
 def readinto(s,buf):
  n=len(buf);p=0
  while p<n:
   if s.o>=len(s.b):
    r=_mx_rq(4,s.m,s.h.to_bytes(2,'little')+min(__CHUNK__,65535).to_bytes(2,'little'))
    if not r:break
    s.b=r;s.o=0
   a=min(n-p,len(s.b)-s.o)
   buf[p:p+a]=s.b[s.o:s.o+a]
   s.o+=a;p+=a
  return p
 def read(s,n=-1):
  if n is None or n<0:
   d=b''
   while True:
    b=bytearray(__CHUNK__)
    g=s.readinto(b)
    if not g:break
    d+=bytes(b[:g])
  else:
   b=bytearray(n)
   d=bytes(b[:s.readinto(b)])
  return str(d,'utf8') if s.t else d
 def readline(s):
  r=bytearray()
  while True:
   b=bytearray(1)
   if not s.readinto(b):break
   r+=b
   if b[0]==10:break
  return str(r,'utf8') if s.t else bytes(r)
 def write(s,d):
  if s.t and isinstance(d,str):d=d.encode('utf8')
  d=bytes(d);w=0
  while w<len(d):
   c=d[w:w+__CHUNK__]
   r=_mx_rq(6,s.m,s.h.to_bytes(2,'little')+c)
   w+=_mx_u16(r,0)
  return w
 def ioctl(s,q,a):
  if q==4:s.close()
  if q==11:return __CHUNK__
  return 0
 def close(s):
  if s.h>=0:
   _mx_rq(5,s.m,s.h.to_bytes(2,'little'))
   s.h=-1
 def __enter__(s):return s
 def __exit__(s,*a):s.close()
class _MXFS:
 def __init__(s,m):
  s.m=m;s.c='/'
 def mount(s,ro,mkfs):pass
 def umount(s):pass
 def chdir(s,p):
  if p.startswith('/'):s.c=p
  elif p=='..':s.c='/'.join(s.c.rstrip('/').split('/')[:-1]) or '/'
  else:s.c=s.c.rstrip('/')+'/'+p
 def getcwd(s):return s.c
 def _a(s,p):
  if not p or p=='.':return s.c
  if p.startswith('/'):return p
  return s.c.rstrip('/')+'/'+p
 def stat(s,p):
  r=_mx_rq(1,s.m,s._a(p).encode())
  m=0x4000 if r[0] else 0x8000
  t=_mx_u32(r,5)
  return (m,0,0,0,0,0,_mx_u32(r,1),t,t,t)
 def ilistdir(s,p):
  r=_mx_rq(2,s.m,s._a(p).encode())
  n=_mx_u16(r,0);o=2;e=[]
  for _ in range(n):
   l=_mx_u16(r,o);o+=2
   nm=str(r[o:o+l],'utf8');o+=l
   d=r[o];o+=1
   z=_mx_u32(r,o);o+=4
   e.append((nm,0x4000 if d else 0x8000,0,z))
  return e
 def open(s,p,m):
  b='w' if 'w' in m else 'a' if 'a' in m else 'r'
  r=_mx_rq(3,s.m,b.encode()+s._a(p).encode())
  return _MXFile(s.m,_mx_u16(r,0),'b' not in m)
 def mkdir(s,p):
  _mx_rq(8,s.m,s._a(p).encode())
 def remove(s,p):
  _mx_rq(7,s.m,s._a(p).encode())
 def rmdir(s,p):
  _mx_rq(7,s.m,s._a(p).encode())
 def rename(s,a,b):
  f=s._a(a).encode()
  _mx_rq(9,s.m,len(f).to_bytes(2,'little')+f+s._a(b).encode())
def _mx_mnt(mp,m):
 try:
  os.umount(mp)
 except OSError:
  pass
 os.mount(_MXFS(m),mp)
"#;

/// Renders the agent for a given transfer chunk size.
#[must_use]
pub fn agent_install(chunk: usize) -> String {
    AGENT_SOURCE.replace("__CHUNK__", &chunk.to_string())
}

/// Code unit that registers a VFS instance at `mount_point`.
#[must_use]
pub fn mount_call(mount_point: &str, mount_id: u8) -> String {
    format!(
        "_mx_mnt('{}',{mount_id})",
        crate::device::py_str_escape(mount_point)
    )
}

/// Code unit that removes the VFS registration again.
#[must_use]
pub fn umount_call(mount_point: &str) -> String {
    format!(
        "try:\n import os\n os.umount('{}')\nexcept OSError:\n pass",
        crate::device::py_str_escape(mount_point)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_placeholder_fully_substituted() {
        let code = agent_install(4096);
        assert!(!code.contains("__CHUNK__"));
        assert!(code.contains("min(4096,65535)"));
    }

    #[test]
    fn agent_speaks_the_frame_magic() {
        let code = agent_install(512);
        // The escape pair the host scans for, spelled as Python bytes.
        assert!(code.contains(r"b'\x18\xa6'"));
    }

    #[test]
    fn mount_call_escapes_quotes() {
        assert_eq!(mount_call("/remote", 2), "_mx_mnt('/remote',2)");
        assert!(mount_call("/it's", 0).contains(r"\'"));
    }
}
